use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::rabbitmq::amqp_client::OutboundMessage;
use crate::rabbitmq::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// An outbound message. Built once and handed to
/// [`Publisher::publish`](crate::rabbitmq::Publisher::publish).
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

impl Event {
    /// Creates an event with a generated message id and the current timestamp.
    pub fn new(exchange: &str, routing_key: &str, body: Vec<u8>) -> Self {
        Event {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id: Uuid::new_v4().to_string(),
            content_type: BINARY_CONTENT_TYPE.to_string(),
            timestamp: Utc::now(),
            body,
        }
    }

    /// Creates an event whose body is `payload` serialized as JSON.
    pub fn json<T: Serialize>(exchange: &str, routing_key: &str, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(Self::new(exchange, routing_key, body).with_content_type(JSON_CONTENT_TYPE))
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub(crate) fn to_message(&self) -> OutboundMessage {
        OutboundMessage {
            message_id: self.message_id.clone(),
            content_type: self.content_type.clone(),
            timestamp: self.timestamp,
            body: self.body.clone(),
        }
    }
}
