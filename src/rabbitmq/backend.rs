// src/rabbitmq/backend.rs
//! The seam between the broker client and the wire library.
//!
//! A [`Backend`] dials the message-queueing server and hands back a [`Session`], which bundles
//! one connection with one channel opened on it. The client never touches `lapin` directly,
//! so the same supervisor and topology code drive both [`super::LapinBackend`] and the
//! in-process [`super::MemoryBackend`].

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;

/// Queue parameters as declared, plus the counters the backend reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl QueueDescriptor {
    /// A durable, non-exclusive, non-auto-deleted queue.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            exclusive: false,
            message_count: 0,
            consumer_count: 0,
        }
    }

    /// Whether two descriptors name the same queue with the same declaration flags.
    pub fn is_equivalent(&self, other: &QueueDescriptor) -> bool {
        self.name == other.name
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.exclusive == other.exclusive
    }
}

/// A direct exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDescriptor {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// An inbound message exactly as the backend handed it over.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub data: Vec<u8>,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
}

pub type RawDeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Opens sessions against a backend URI.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Session: Session;

    /// Dial the backend and open a channel on the new connection.
    async fn open(&self, uri: &str) -> Result<Self::Session>;
}

/// One connection plus one channel.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Whether both the connection and its channel still report themselves open.
    fn is_live(&self) -> bool;

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<QueueDescriptor>;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Submit a payload for routing. Non-mandatory and non-immediate: unroutable messages are
    /// dropped by the backend.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<()>;

    /// Register an auto-acknowledging, non-exclusive consumer on `queue`.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<RawDeliveryStream>;

    /// Close the channel, then the connection. Handles that are already closed are skipped.
    async fn close(&self) -> Result<()>;
}
