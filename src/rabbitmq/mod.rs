// src/rabbitmq/mod.rs
// Resilient RabbitMQ client: connection supervision, publishing and consuming

pub mod amqp_client;
pub mod backoff;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod lapin_client;
pub mod publisher;

#[cfg(test)]
pub(crate) mod testing;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{BrokerChannel, BrokerConnection, BrokerDialer, CloseReason, Delivery};
pub use backoff::BackoffPolicy;
pub use connection::ConnectionSupervisor;
pub use consumer::{Consumer, ConsumerConfig, DeliveryHandler, QosConfig};
pub use errors::{RabbitMQError, Result};
pub use lapin_client::LapinDialer;
pub use publisher::Publisher;
