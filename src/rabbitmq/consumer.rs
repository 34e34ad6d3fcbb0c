// src/rabbitmq/consumer.rs

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::types::{AMQPValue, FieldTable};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::amqp_client::{BrokerChannel, ConsumeOptions, Delivery};
use super::backoff::{Backoff, BackoffPolicy};
use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};

/// Prefetch limits applied to every channel the consumer opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,
    pub prefetch_size: u32,
    pub global: bool,
}

impl Default for QosConfig {
    fn default() -> Self {
        QosConfig {
            prefetch_count: 10,
            prefetch_size: 0,
            global: false,
        }
    }
}

/// Settings for one consumption loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Let the broker settle messages on delivery instead of acking manually
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
    /// Fixed consumer tag; a random `consumer-<uuid>` tag is used otherwise
    pub consumer_tag: Option<String>,
    pub qos: QosConfig,
    pub backoff: BackoffPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            auto_ack: false,
            exclusive: false,
            no_local: false,
            no_wait: false,
            arguments: FieldTable::default(),
            consumer_tag: None,
            qos: QosConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_no_local(mut self, no_local: bool) -> Self {
        self.no_local = no_local;
        self
    }

    pub fn with_no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn with_argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Self {
        self.qos = QosConfig {
            prefetch_count,
            prefetch_size,
            global,
        };
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            auto_ack: self.auto_ack,
            exclusive: self.exclusive,
            no_local: self.no_local,
            no_wait: self.no_wait,
        }
    }
}

/// Business logic run for each delivery. An error leads to a requeueing
/// nack when the consumer acknowledges manually.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, token: &CancellationToken, delivery: &Delivery) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(CancellationToken, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, token: &CancellationToken, delivery: &Delivery) -> anyhow::Result<()> {
        (self)(token.clone(), delivery.clone()).await
    }
}

/// Consumes one queue until cancelled, reopening its channel whenever it or
/// the underlying connection goes away.
pub struct Consumer {
    supervisor: Arc<ConnectionSupervisor>,
    config: ConsumerConfig,
    span: Span,
}

impl Consumer {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: ConsumerConfig) -> Self {
        Consumer {
            supervisor,
            config,
            span: info_span!("consumer"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Deliver messages from `queue` to `handler` until `token` is cancelled.
    /// Deliveries are handled one at a time, in broker order.
    pub async fn consume<H: DeliveryHandler>(&self, token: &CancellationToken, queue: &str, handler: H) {
        let span = info_span!(parent: &self.span, "consume", queue = %queue);
        self.run(token, queue, &handler).instrument(span).await
    }

    async fn run<H: DeliveryHandler>(&self, token: &CancellationToken, queue: &str, handler: &H) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        info!("Consumer started");

        while !token.is_cancelled() {
            match self.consume_session(token, queue, handler).await {
                // The broker accepted the subscription, so the failure streak is over
                Ok(handled) => {
                    debug!(handled, "Consumer session ended");
                    backoff.reset();
                }
                Err(err) => warn!(error = %err, "Consumer session failed"),
            }
            if token.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            if backoff.is_circuit_open() && backoff.failures() == self.config.backoff.circuit_threshold {
                error!(
                    failures = backoff.failures(),
                    "Consumer keeps failing, backing off for {:?} between attempts",
                    delay
                );
            } else {
                debug!(failures = backoff.failures(), "Reopening consumer in {:?}", delay);
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        info!("Consumer stopped");
    }

    /// One channel's worth of consumption. Returns the number of deliveries
    /// handled before the channel or stream ended. Errors mean the
    /// subscription was never established.
    async fn consume_session<H: DeliveryHandler>(
        &self,
        token: &CancellationToken,
        queue: &str,
        handler: &H,
    ) -> Result<u64> {
        let connection = match self.supervisor.get_connection().await {
            Some(connection) if !connection.is_closed() => connection,
            _ => return Err(RabbitMQError::NotReady),
        };
        let channel = connection.channel().await?;

        let result = self.receive(channel.as_ref(), token, queue, handler).await;

        if !channel.is_closed() {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Failed to close consumer channel");
            }
        }
        result
    }

    async fn receive<H: DeliveryHandler>(
        &self,
        channel: &dyn BrokerChannel,
        token: &CancellationToken,
        queue: &str,
        handler: &H,
    ) -> Result<u64> {
        let qos = self.config.qos;
        channel
            .qos(qos.prefetch_count, qos.prefetch_size, qos.global)
            .await?;

        let consumer_tag = self
            .config
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));
        let mut deliveries = channel
            .consume(
                queue,
                &consumer_tag,
                self.config.consume_options(),
                self.config.arguments.clone(),
            )
            .await?;
        info!(consumer_tag = %consumer_tag, "Started consuming from queue");

        let mut handled = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(handled),
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.dispatch(token, handler, delivery).await;
                    handled += 1;
                }
                Some(Err(err)) => {
                    error!(error = %err, "Error receiving message");
                    return Ok(handled);
                }
                None => {
                    warn!("Delivery stream closed, reopening channel");
                    return Ok(handled);
                }
            }
        }
    }

    async fn dispatch<H: DeliveryHandler>(&self, token: &CancellationToken, handler: &H, delivery: Delivery) {
        let outcome = handler.handle(token, &delivery).await;

        if self.config.auto_ack {
            if let Err(err) = outcome {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    message_id = ?delivery.message_id,
                    "Handler failed on auto-acked message: {:#}",
                    err
                );
            }
            return;
        }

        match outcome {
            Ok(()) => {
                if let Err(err) = delivery.ack().await {
                    error!(delivery_tag = delivery.delivery_tag, "Failed to acknowledge message: {}", err);
                }
            }
            Err(err) => {
                error!(
                    delivery_tag = delivery.delivery_tag,
                    message_id = ?delivery.message_id,
                    "Error processing message: {:#}",
                    err
                );
                if let Err(err) = delivery.nack(true).await {
                    error!(
                        delivery_tag = delivery.delivery_tag,
                        "Failed to negatively acknowledge message: {}",
                        err
                    );
                }
            }
        }
    }
}
