// src/rabbitmq/topology.rs

use tracing::{debug, info};

use super::backend::{ExchangeDescriptor, QueueDescriptor, Session};
use super::errors::{RabbitMQError, Result};

/// The durable objects routing depends on: one queue and, optionally, a direct exchange
/// bound to it with the queue's own name as routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    queue: String,
    exchange: String,
}

impl Topology {
    /// An empty `exchange` means messages go through the default exchange.
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Result<Self> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(RabbitMQError::TopologyError(
                "Queue name must not be empty".to_string(),
            ));
        }

        Ok(Self {
            queue,
            exchange: exchange.into(),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Empty when the default exchange is used.
    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn has_exchange(&self) -> bool {
        !self.exchange.is_empty()
    }

    pub fn routing_key(&self) -> &str {
        &self.queue
    }

    pub fn queue_descriptor(&self) -> QueueDescriptor {
        QueueDescriptor::durable(self.queue.clone())
    }

    pub fn exchange_descriptor(&self) -> Option<ExchangeDescriptor> {
        self.has_exchange()
            .then(|| ExchangeDescriptor::durable(self.exchange.clone()))
    }

    /// Declare the queue, then the exchange and binding when an exchange is configured.
    ///
    /// Every step is idempotent against a backend that already holds identical objects. The
    /// first failing step aborts the sequence and its error is returned unchanged.
    pub async fn declare<S: Session + ?Sized>(&self, session: &S) -> Result<QueueDescriptor> {
        debug!(queue = %self.queue, "Declaring queue");
        let queue = session.declare_queue(&self.queue_descriptor()).await?;

        if let Some(exchange) = self.exchange_descriptor() {
            debug!(exchange = %exchange.name, "Declaring exchange");
            session.declare_exchange(&exchange).await?;

            debug!(
                queue = %queue.name,
                exchange = %exchange.name,
                routing_key = %self.routing_key(),
                "Binding queue"
            );
            session
                .bind_queue(&queue.name, &exchange.name, self.routing_key())
                .await?;
        }

        info!(
            queue = %queue.name,
            exchange = %self.exchange,
            messages = queue.message_count,
            "Topology declared"
        );
        Ok(queue)
    }
}
