//! A RabbitMQ broker client that keeps its queue/exchange topology declared across dropped
//! connections, publishes JSON messages and consumes them back as decoded values.
//!
//! The [`transcode`] module wraps the external video codec used by the compression service.

pub mod config;
pub mod env;
pub mod logging;
pub mod message;
pub mod rabbitmq;
pub mod transcode;

pub use env::Config;
pub use message::Message;
pub use rabbitmq::{BrokerClient, BrokerSettings, Delivered, Deliveries, RabbitMQError};
