// src/rabbitmq/errors.rs

use lapin::protocol::AMQPErrorKind;
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ connection closed: {0}")]
    ConnectionClosed(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ channel closed: {0}")]
    ChannelClosed(String),

    #[error("RabbitMQ broker not ready")]
    NotReady,

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Timeout: {0}")]
    TimeoutError(String),

    #[error("Connection supervisor has been shut down")]
    Terminated,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RabbitMQError {
    /// True when the failure means the channel in use is gone and a fresh one
    /// may succeed. A closed connection takes its channels down with it.
    pub fn is_channel_closed(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ChannelClosed(_) | RabbitMQError::ConnectionClosed(_)
        )
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// Converting from lapin errors
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidChannelState(_) | LapinError::InvalidChannel(_) => {
                RabbitMQError::ChannelClosed(error.to_string())
            }
            LapinError::InvalidConnectionState(_) | LapinError::MissingHeartbeatError => {
                RabbitMQError::ConnectionClosed(error.to_string())
            }
            LapinError::IOError(_) => RabbitMQError::ConnectionError(error.to_string()),
            LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error.to_string()),
            // Soft errors close the channel, hard errors the whole connection
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(_) => RabbitMQError::ChannelError(error.to_string()),
                AMQPErrorKind::Hard(_) => RabbitMQError::ConnectionClosed(error.to_string()),
            },
            _ => RabbitMQError::Unknown(error.to_string()),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Operation timed out".to_string())
    }
}
