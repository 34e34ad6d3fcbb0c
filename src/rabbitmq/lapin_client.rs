// src/rabbitmq/lapin_client.rs
//! [`BrokerDialer`] and friends implemented over `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use super::amqp_client::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerDialer, CloseNotifier, CloseReason,
    CloseSignal, ConsumeOptions, Delivery, DeliveryStream, OutboundMessage,
};
use super::errors::{RabbitMQError, Result};
use super::connection::redact_endpoint;

/// Dials real RabbitMQ nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinDialer;

impl LapinDialer {
    pub fn new() -> Self {
        LapinDialer
    }
}

#[async_trait]
impl BrokerDialer for LapinDialer {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>> {
        debug!(endpoint = %redact_endpoint(endpoint), "Dialing RabbitMQ");
        let connection = Connection::connect(endpoint, ConnectionProperties::default()).await?;

        let notifier = CloseNotifier::new();
        let on_error = notifier.clone();
        connection.on_error(move |err| {
            on_error.fire(CloseReason::Error(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            endpoint: endpoint.to_string(),
            inner: connection,
            notifier,
        }))
    }
}

pub struct LapinConnection {
    endpoint: String,
    inner: Connection,
    notifier: CloseNotifier,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;

        let notifier = CloseNotifier::new();
        let on_error = notifier.clone();
        channel.on_error(move |err| {
            on_error.fire(CloseReason::Error(err.to_string()));
        });

        // lapin does not always report a dead connection on each channel
        let parent = self.notifier.subscribe();
        let own = notifier.subscribe();
        let child = notifier.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = parent.closed() => {
                    child.fire(reason);
                }
                _ = own.closed() => {}
            }
        });

        Ok(Arc::new(LapinChannel {
            inner: channel,
            notifier,
        }))
    }

    async fn close(&self) -> Result<()> {
        let result = if self.inner.status().connected() {
            self.inner.close(200, "Closing connection").await
        } else {
            Ok(())
        };
        self.notifier.fire(CloseReason::Graceful);
        result.map_err(Into::into)
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_fired() || !self.inner.status().connected()
    }

    fn notify_close(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

pub struct LapinChannel {
    inner: Channel,
    notifier: CloseNotifier,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn close(&self) -> Result<()> {
        let result = if self.inner.status().connected() {
            self.inner.close(200, "Closing channel").await
        } else {
            Ok(())
        };
        self.notifier.fire(CloseReason::Graceful);
        result.map_err(Into::into)
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_fired() || !self.inner.status().connected()
    }

    fn notify_close(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        if prefetch_size > 0 {
            // RabbitMQ rejects non-zero prefetch sizes and lapin does not expose it
            warn!(prefetch_size, "Ignoring unsupported QoS prefetch size");
        }
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        immediate: bool,
        message: OutboundMessage,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(message.message_id.into())
            .with_content_type(message.content_type.into())
            .with_timestamp(message.timestamp.timestamp() as u64);

        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions { mandatory, immediate },
                &message.body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                arguments,
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(into_delivery).map_err(RabbitMQError::from))
            .boxed())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = delivery.properties;
    let mut inbound = Delivery::new(
        delivery.delivery_tag,
        delivery.data,
        Arc::new(LapinAcker(delivery.acker)),
    )
    .with_route(delivery.exchange.as_str(), delivery.routing_key.as_str())
    .with_redelivered(delivery.redelivered);

    if let Some(message_id) = properties.message_id() {
        inbound = inbound.with_message_id(message_id.as_str());
    }
    if let Some(content_type) = properties.content_type() {
        inbound = inbound.with_content_type(content_type.as_str());
    }
    inbound
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| RabbitMQError::AckError(err.to_string()))?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|err| RabbitMQError::AckError(err.to_string()))?;
        Ok(())
    }
}
