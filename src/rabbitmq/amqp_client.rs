// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{
    Backend, ExchangeDescriptor, QueueDescriptor, RawDelivery, RawDeliveryStream, Session,
};
use super::errors::{RabbitMQError, Result};

/// Connection properties shared by every session this process opens.
pub fn connection_properties(connection_name: &str) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(connection_name.to_string().into())
}

/// Opens [`LapinSession`]s against a RabbitMQ server.
#[derive(Debug, Clone)]
pub struct LapinBackend {
    connection_name: String,
}

impl LapinBackend {
    pub fn new() -> Self {
        Self::with_connection_name("broker_service")
    }

    /// The name shows up in the management UI's connection list.
    pub fn with_connection_name(name: impl Into<String>) -> Self {
        Self {
            connection_name: name.into(),
        }
    }
}

impl Default for LapinBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for LapinBackend {
    type Session = LapinSession;

    async fn open(&self, uri: &str) -> Result<LapinSession> {
        info!(connection_name = %self.connection_name, "Connecting to RabbitMQ");
        let connection = Connection::connect(uri, connection_properties(&self.connection_name))
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(200, "Channel open failed").await {
                    warn!("Failed to close connection after channel error: {}", close_err);
                }
                return Err(RabbitMQError::ChannelError(format!(
                    "Failed to create channel: {}",
                    e
                )));
            }
        };

        debug!(channel_id = channel.id(), "Channel opened");
        Ok(LapinSession {
            connection,
            channel,
        })
    }
}

/// A lapin connection and the single channel the client uses on it.
pub struct LapinSession {
    connection: Connection,
    channel: Channel,
}

impl From<Delivery> for RawDelivery {
    fn from(delivery: Delivery) -> Self {
        RawDelivery {
            content_type: delivery
                .properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string()),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            data: delivery.data,
        }
    }
}

#[async_trait]
impl Session for LapinSession {
    fn is_live(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<QueueDescriptor> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    auto_delete: queue.auto_delete,
                    exclusive: queue.exclusive,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to declare queue '{}': {}",
                    queue.name, e
                ))
            })?;

        Ok(QueueDescriptor {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
            ..queue.clone()
        })
    }

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange.name, e
                ))
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to bind queue '{}' to '{}': {}",
                    queue, exchange, e
                ))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        content_type: &str,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type(content_type.into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> Result<RawDeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(RawDelivery::from)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut first_error = None;

        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "Closing channel").await {
                warn!("Failed to close channel: {}", e);
                first_error.get_or_insert(RabbitMQError::CloseError(e.to_string()));
            }
        }

        if self.connection.status().connected() {
            info!("Closing RabbitMQ connection gracefully");
            if let Err(e) = self.connection.close(200, "Closing connection").await {
                warn!("Failed to close connection: {}", e);
                first_error.get_or_insert(RabbitMQError::CloseError(e.to_string()));
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
