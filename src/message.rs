use serde::de::DeserializeOwned;
use serde::Serialize;

/// A generic message: a JSON object with arbitrary named fields.
pub type Message = serde_json::Map<String, serde_json::Value>;

/// Content type recorded on every published payload.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Serializes a message into the UTF-8 JSON bytes sent on the wire.
pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Decodes one delivery body.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
