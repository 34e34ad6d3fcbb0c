// src/rabbitmq/amqp_client.rs
//! Capability traits over an AMQP client.
//!
//! The supervisor, publisher and consumer only talk to these traits, so the
//! wire protocol stays behind whichever implementation is plugged in
//! ([`crate::rabbitmq::lapin_client`] in production, a mock broker in tests).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use lapin::types::FieldTable;
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use super::errors::{RabbitMQError, Result};

/// Why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request, by us or by the broker.
    Graceful,
    /// Closed because of an error.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Graceful => write!(f, "closed gracefully"),
            CloseReason::Error(reason) => write!(f, "closed with error: {}", reason),
        }
    }
}

/// Sender half of a close notification. Fires at most once; later calls to
/// [`CloseNotifier::fire`] are ignored.
#[derive(Clone)]
pub struct CloseNotifier {
    state: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Latch the close reason. Returns false if it had already fired.
    pub fn fire(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn is_fired(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn subscribe(&self) -> CloseSignal {
        CloseSignal {
            state: self.state.subscribe(),
        }
    }
}

impl Default for CloseNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half of a close notification. Subscribing after the close has
/// already happened resolves immediately.
pub struct CloseSignal {
    state: watch::Receiver<Option<CloseReason>>,
}

impl CloseSignal {
    pub async fn closed(mut self) -> CloseReason {
        match self.state.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or(CloseReason::Graceful),
            // Notifier dropped along with its resource
            Err(_) => CloseReason::Graceful,
        }
    }
}

/// Outbound message body and properties handed to [`BrokerChannel::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub body: Vec<u8>,
}

/// Flags for [`BrokerChannel::consume`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// One inbound message.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            message_id: None,
            content_type: None,
            data,
            acker,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_route(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data)
            .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live (or formerly live) broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Endpoint this connection was dialed from.
    fn endpoint(&self) -> &str;

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn notify_close(&self) -> CloseSignal;
}

/// A channel multiplexed over one connection. Dead once it or its connection
/// closes.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn notify_close(&self) -> CloseSignal;

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: OutboundMessage,
    ) -> Result<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream>;
}
