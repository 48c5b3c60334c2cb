// src/rabbitmq/mod.rs
// RabbitMQ broker client: topology, lazy reconnect, JSON publish/consume

pub mod errors;
pub mod backend;
pub mod connection;
pub mod memory;

mod amqp_client;
mod client;
mod consumer;
mod topology;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{connection_properties, LapinBackend, LapinSession};
pub use backend::{
    Backend, ExchangeDescriptor, QueueDescriptor, RawDelivery, RawDeliveryStream, Session,
};
pub use client::{BrokerClient, BrokerSettings};
pub use connection::{ConnectionSupervisor, LiveSession};
pub use consumer::{Deliveries, Delivered};
pub use errors::{RabbitMQError, Result};
pub use memory::{MemoryBackend, MemorySession, MemoryStats};
pub use topology::Topology;
