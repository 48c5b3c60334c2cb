// Broker client behaviour against the in-process backend: topology, publish/consume,
// lazy reconnect and error isolation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_service::rabbitmq::{
    Backend, BrokerClient, BrokerSettings, MemoryBackend, MemorySession, RabbitMQError,
};
use broker_service::Message;
use futures::StreamExt;
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;

const QUEUE: &str = "test_queue";
const EXCHANGE: &str = "test_exchange";

fn settings(exchange: &str) -> BrokerSettings {
    BrokerSettings::new("memory://localhost", QUEUE, exchange)
}

async fn client(backend: &MemoryBackend) -> BrokerClient<MemoryBackend> {
    BrokerClient::with_backend(backend.clone(), settings(EXCHANGE))
        .await
        .expect("client should connect to the memory backend")
}

async fn next_within<S: futures::Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("delivery should arrive")
}

struct Unrepresentable;

impl Serialize for Unrepresentable {
    fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(S::Error::custom("cannot be represented as JSON"))
    }
}

#[tokio::test]
async fn test_end_to_end_publish_and_consume() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    broker
        .publish(&json!({"id": 1, "message": "hello"}))
        .await
        .unwrap();

    let delivery = next_within(&mut deliveries).await.unwrap();
    assert_eq!(
        serde_json::Value::Object(delivery.body),
        json!({"id": 1, "message": "hello"})
    );
    assert_eq!(delivery.exchange, EXCHANGE);
    assert_eq!(delivery.routing_key, QUEUE);
    assert!(!delivery.redelivered);
}

#[tokio::test]
async fn test_constructing_twice_is_idempotent() {
    let backend = MemoryBackend::new();

    let first = client(&backend).await;
    let second = client(&backend).await;

    assert_eq!(first.topology(), second.topology());
    assert_eq!(backend.bindings().len(), 1);
    assert!(backend.has_binding(EXCHANGE, QUEUE, QUEUE));
    let queue = backend.queue(QUEUE).unwrap();
    assert!(queue.durable && !queue.auto_delete && !queue.exclusive);
}

#[tokio::test]
async fn test_single_publish_yields_exactly_one_delivery() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    broker.publish(&json!({"id": 7})).await.unwrap();

    let delivery = next_within(&mut deliveries).await.unwrap();
    assert_eq!(delivery.body.get("id"), Some(&json!(7)));
    assert!(
        timeout(Duration::from_millis(100), deliveries.next())
            .await
            .is_err(),
        "no duplicate delivery expected"
    );
    assert_eq!(backend.queue(QUEUE).unwrap().message_count, 0);
}

#[tokio::test]
async fn test_publish_after_connection_loss_reconnects_once() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let topology_before = broker.topology().clone();

    backend.kill_connections();
    assert!(!broker.is_connected().await);

    broker.publish(&json!({"id": 2})).await.unwrap();

    let stats = backend.stats();
    assert_eq!(stats.connections_opened, 2);
    assert_eq!(stats.queue_declarations, 2);
    assert_eq!(stats.exchange_declarations, 2);
    assert_eq!(stats.bindings_created, 2);
    assert_eq!(broker.reconnect_count(), 1);
    assert_eq!(broker.topology(), &topology_before);
    assert_eq!(backend.bindings().len(), 1);
    assert!(backend.has_binding(EXCHANGE, QUEUE, QUEUE));
    assert_eq!(backend.queue(QUEUE).unwrap().message_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_share_one_reconnect() {
    let backend = MemoryBackend::new();
    let broker = Arc::new(client(&backend).await);

    backend.kill_connections();

    let publishers: Vec<_> = (0..16)
        .map(|id| {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish(&json!({ "id": id })).await })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap().unwrap();
    }

    assert_eq!(backend.stats().connections_opened, 2);
    assert_eq!(broker.reconnect_count(), 1);
    assert_eq!(backend.queue(QUEUE).unwrap().message_count, 16);
}

#[tokio::test]
async fn test_unserializable_message_touches_nothing() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    backend.kill_connections();
    let before = backend.stats();

    let err = broker.publish(&Unrepresentable).await.unwrap_err();

    assert!(matches!(err, RabbitMQError::SerializationError(_)));
    assert_eq!(backend.stats(), before);
    assert_eq!(broker.reconnect_count(), 0);
    assert!(!broker.is_connected().await);
}

#[tokio::test]
async fn test_malformed_delivery_does_not_end_stream() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    backend.publish_raw(EXCHANGE, QUEUE, b"{\"id\": 1, broken");
    broker.publish(&json!({"id": 2})).await.unwrap();
    backend.publish_raw(EXCHANGE, QUEUE, b"[\"not\", \"an\", \"object\"]");
    broker.publish(&json!({"id": 3})).await.unwrap();

    let first = next_within(&mut deliveries).await.unwrap();
    let second = next_within(&mut deliveries).await.unwrap();
    assert_eq!(first.body.get("id"), Some(&json!(2)));
    assert_eq!(second.body.get("id"), Some(&json!(3)));
    assert_eq!(deliveries.skipped(), 2);
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Upload {
    id: u64,
    file: String,
}

#[tokio::test]
async fn test_typed_messages_round_trip() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Upload>().await.unwrap();

    let upload = Upload {
        id: 9,
        file: "clip.mp4".to_string(),
    };
    broker.publish(&upload).await.unwrap();

    assert_eq!(next_within(&mut deliveries).await.unwrap().body, upload);
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let backend = MemoryBackend::new();
    let broker = BrokerClient::with_backend(backend.clone(), settings(""))
        .await
        .unwrap();
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    broker.publish(&json!({"id": 4})).await.unwrap();

    let delivery = next_within(&mut deliveries).await.unwrap();
    assert_eq!(delivery.exchange, "");
    assert_eq!(delivery.routing_key, QUEUE);
    assert!(backend.bindings().is_empty());
    assert_eq!(backend.stats().exchange_declarations, 0);
}

#[tokio::test]
async fn test_stream_ends_on_connection_loss_and_consume_resubscribes() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    backend.kill_connections();
    assert!(next_within(&mut deliveries).await.is_none());

    let mut resumed = broker.consume::<Message>().await.unwrap();
    assert_ne!(resumed.consumer_tag(), deliveries.consumer_tag());
    assert_eq!(backend.consumer_tags(QUEUE), vec![resumed.consumer_tag().to_string()]);

    broker.publish(&json!({"id": 5})).await.unwrap();
    let delivery = next_within(&mut resumed).await.unwrap();
    assert_eq!(delivery.body.get("id"), Some(&json!(5)));
    assert_eq!(broker.reconnect_count(), 1);
}

#[tokio::test]
async fn test_construction_fails_when_backend_refuses() {
    let backend = MemoryBackend::new();
    backend.set_refuse_connections(true);

    let result = BrokerClient::with_backend(backend.clone(), settings(EXCHANGE)).await;

    assert!(matches!(result, Err(RabbitMQError::ConnectionError(_))));
}

#[tokio::test]
async fn test_failed_reconnect_is_reported_and_retried() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;

    backend.kill_connections();
    backend.set_fail_bindings(true);
    let err = broker.publish(&json!({"id": 6})).await.unwrap_err();
    assert!(matches!(err, RabbitMQError::TopologyError(_)));
    assert_eq!(backend.stats().live_sessions, 0);

    backend.set_fail_bindings(false);
    broker.publish(&json!({"id": 6})).await.unwrap();
    assert_eq!(broker.reconnect_count(), 1);
    assert_eq!(backend.queue(QUEUE).unwrap().message_count, 1);
}

#[tokio::test]
async fn test_empty_queue_name_is_rejected() {
    let backend = MemoryBackend::new();
    let result =
        BrokerClient::with_backend(backend.clone(), BrokerSettings::new("memory://", "", "")).await;

    assert!(matches!(result, Err(RabbitMQError::TopologyError(_))));
    assert_eq!(backend.stats().connections_opened, 0);
}

#[tokio::test]
async fn test_close_releases_and_tolerates_repeat() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;

    broker.close().await.unwrap();
    broker.close().await.unwrap();

    assert_eq!(backend.stats().live_sessions, 0);
    assert!(!broker.is_connected().await);
}

/// Takes longer to open a connection than any sensible connect timeout.
struct StalledBackend(MemoryBackend);

#[async_trait]
impl Backend for StalledBackend {
    type Session = MemorySession;

    async fn open(&self, uri: &str) -> broker_service::rabbitmq::Result<MemorySession> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        self.0.open(uri).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_is_reported() {
    let backend = StalledBackend(MemoryBackend::new());
    let settings = settings(EXCHANGE).with_connect_timeout(Duration::from_millis(200));

    let result = BrokerClient::with_backend(backend, settings).await;

    assert!(matches!(result, Err(RabbitMQError::TimeoutError(_))));
}

#[tokio::test]
async fn test_reconnect_failing_in_topology_is_recoverable() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;

    backend.kill_connections();
    backend.set_fail_bindings(true);
    let err = broker.consume::<Message>().await.err().unwrap();
    assert!(matches!(err, RabbitMQError::TopologyError(_)));
    assert!(!err.is_connectivity());
    assert!(broker.is_recoverable(&err).await);

    backend.set_fail_bindings(false);
    let mut deliveries = broker.consume::<Message>().await.unwrap();
    broker.publish(&json!({"id": 8})).await.unwrap();

    let delivery = next_within(&mut deliveries).await.unwrap();
    assert_eq!(delivery.body.get("id"), Some(&json!(8)));
    assert_eq!(broker.reconnect_count(), 1);
}

#[tokio::test]
async fn test_local_failure_on_live_client_is_not_recoverable() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;

    let err = broker.publish(&Unrepresentable).await.unwrap_err();

    assert!(broker.is_connected().await);
    assert!(!broker.is_recoverable(&err).await);
}

#[tokio::test]
async fn test_delivery_carries_content_type() {
    let backend = MemoryBackend::new();
    let broker = client(&backend).await;
    let mut deliveries = broker.consume::<Message>().await.unwrap();

    broker.publish(&json!({"id": 10})).await.unwrap();
    backend.publish_raw(EXCHANGE, QUEUE, br#"{"id": 11}"#);

    let published = next_within(&mut deliveries).await.unwrap();
    let raw = next_within(&mut deliveries).await.unwrap();
    assert_eq!(published.content_type.as_deref(), Some("application/json"));
    assert_eq!(raw.content_type.as_deref(), Some("application/octet-stream"));
}
