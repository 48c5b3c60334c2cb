// src/rabbitmq/consumer.rs

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use super::backend::RawDeliveryStream;
use crate::message;

/// A delivery whose body decoded successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered<T> {
    pub body: T,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// As set by the publisher, if at all.
    pub content_type: Option<String>,
}

/// Decoded deliveries from one subscription.
///
/// Items that are not valid JSON for `T` are logged and skipped. The stream ends when the
/// backend closes the subscription or reports an error on it; call
/// [`super::BrokerClient::consume`] again to re-subscribe.
pub struct Deliveries<T> {
    inner: RawDeliveryStream,
    queue: String,
    consumer_tag: String,
    skipped: u64,
    finished: bool,
    _body: PhantomData<fn() -> T>,
}

impl<T> Deliveries<T> {
    pub(crate) fn new(inner: RawDeliveryStream, queue: String, consumer_tag: String) -> Self {
        Self {
            inner,
            queue,
            consumer_tag,
            skipped: 0,
            finished: false,
            _body: PhantomData,
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Number of deliveries dropped so far because they failed to decode.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl<T: DeserializeOwned> Stream for Deliveries<T> {
    type Item = Delivered<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    error!(queue = %this.queue, consumer_tag = %this.consumer_tag, "Error receiving message: {}", e);
                    this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(raw))) => match message::decode::<T>(&raw.data) {
                    Ok(body) => {
                        return Poll::Ready(Some(Delivered {
                            body,
                            delivery_tag: raw.delivery_tag,
                            exchange: raw.exchange,
                            routing_key: raw.routing_key,
                            redelivered: raw.redelivered,
                            content_type: raw.content_type,
                        }))
                    }
                    Err(e) => {
                        this.skipped += 1;
                        warn!(
                            queue = %this.queue,
                            delivery_tag = raw.delivery_tag,
                            "Failed to decode message, skipping: {}",
                            e
                        );
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::{RabbitMQError, RawDelivery};
    use futures::stream;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        id: u32,
    }

    fn raw(tag: u64, data: &[u8]) -> crate::rabbitmq::Result<RawDelivery> {
        Ok(RawDelivery {
            data: data.to_vec(),
            delivery_tag: tag,
            exchange: "ex".to_string(),
            routing_key: "q".to_string(),
            redelivered: false,
            content_type: Some("application/json".to_string()),
        })
    }

    #[tokio::test]
    async fn malformed_items_are_skipped() {
        let inner = stream::iter(vec![
            raw(1, br#"{"id":1}"#),
            raw(2, b"not json"),
            raw(3, br#"{"wrong":"shape"}"#),
            raw(4, br#"{"id":4}"#),
        ])
        .boxed();
        let mut deliveries: Deliveries<Ping> =
            Deliveries::new(inner, "q".to_string(), "consumer-test".to_string());

        let first = deliveries.next().await.unwrap();
        let second = deliveries.next().await.unwrap();

        assert_eq!(first.body, Ping { id: 1 });
        assert_eq!(second.body, Ping { id: 4 });
        assert_eq!(second.delivery_tag, 4);
        assert_eq!(second.content_type.as_deref(), Some("application/json"));
        assert_eq!(deliveries.skipped(), 2);
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn backend_error_ends_stream() {
        let inner = stream::iter(vec![
            raw(1, br#"{"id":1}"#),
            Err(RabbitMQError::ConsumeError("channel closed".to_string())),
            raw(2, br#"{"id":2}"#),
        ])
        .boxed();
        let mut deliveries: Deliveries<Ping> =
            Deliveries::new(inner, "q".to_string(), "consumer-test".to_string());

        assert!(deliveries.next().await.is_some());
        assert!(deliveries.next().await.is_none());
        assert!(deliveries.next().await.is_none());
    }
}
