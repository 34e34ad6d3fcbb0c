// src/rabbitmq/publisher.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::amqp_client::BrokerChannel;
use super::connection::ConnectionSupervisor;
use super::errors::{RabbitMQError, Result};
use crate::message::Event;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

struct CachedChannel {
    id: u64,
    channel: Arc<dyn BrokerChannel>,
}

/// Publishes [`Event`]s over a single lazily created channel.
///
/// The channel is recreated on demand after it closes, and a publish that
/// hits a closed channel is retried once on a fresh one. Publishes through
/// one `Publisher` are serialized on its channel.
pub struct Publisher {
    supervisor: Arc<ConnectionSupervisor>,
    channel: Arc<Mutex<Option<CachedChannel>>>,
    generation: AtomicU64,
    retry_delay: Duration,
    publish_timeout: Duration,
    span: Span,
}

impl Publisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Publisher {
            supervisor,
            channel: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            retry_delay: DEFAULT_RETRY_DELAY,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            span: info_span!("publisher"),
        }
    }

    /// Wait before the single retry after a channel-closed failure.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn publish(&self, event: &Event) -> Result<()> {
        let result = async {
            match self.try_publish(event).await {
                Err(err) if err.is_channel_closed() => {
                    warn!(
                        message_id = %event.message_id,
                        error = %err,
                        "Channel closed during publish, retrying on a new channel"
                    );
                    self.discard_channel().await;
                    sleep(self.retry_delay).await;
                    self.try_publish(event).await
                }
                result => result,
            }
        }
        .instrument(self.span.clone())
        .await;

        if result.is_ok() {
            info!(
                parent: &self.span,
                message_id = %event.message_id,
                "Published message to exchange '{}' with routing key '{}'",
                event.exchange,
                event.routing_key
            );
        }
        result
    }

    async fn try_publish(&self, event: &Event) -> Result<()> {
        // Held across the I/O call so one channel never sees interleaved publishes
        let mut slot = self.channel.lock().await;
        // A half-open broker can stall the channel open as well as the confirm
        let channel = timeout(self.publish_timeout, self.ensure_channel(&mut slot)).await??;

        timeout(
            self.publish_timeout,
            channel.publish(
                &event.exchange,
                &event.routing_key,
                false,
                false,
                event.to_message(),
            ),
        )
        .await?
    }

    async fn ensure_channel(
        &self,
        slot: &mut Option<CachedChannel>,
    ) -> Result<Arc<dyn BrokerChannel>> {
        if let Some(cached) = slot.as_ref() {
            if !cached.channel.is_closed() {
                return Ok(cached.channel.clone());
            }
            debug!(channel_id = cached.id, "Cached channel is closed, recreating");
        }
        *slot = None;

        let connection = match self.supervisor.get_connection().await {
            Some(connection) if !connection.is_closed() => connection,
            _ => return Err(RabbitMQError::NotReady),
        };

        let channel = connection.channel().await?;
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.watch_channel(id, &channel);
        *slot = Some(CachedChannel {
            id,
            channel: channel.clone(),
        });

        info!(channel_id = id, "Publisher channel created");
        Ok(channel)
    }

    /// Clear the cached channel once it closes so the next publish reopens it.
    fn watch_channel(&self, id: u64, channel: &Arc<dyn BrokerChannel>) {
        let closed = channel.notify_close();
        let slot = Arc::clone(&self.channel);

        tokio::spawn(
            async move {
                let reason = closed.closed().await;
                let mut slot = slot.lock().await;
                if slot.as_ref().map_or(false, |cached| cached.id == id) {
                    *slot = None;
                    debug!(channel_id = id, reason = %reason, "Publisher channel closed");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    async fn discard_channel(&self) {
        let cached = self.channel.lock().await.take();
        if let Some(cached) = cached {
            if !cached.channel.is_closed() {
                if let Err(err) = cached.channel.close().await {
                    debug!(error = %err, "Failed to close discarded channel");
                }
            }
        }
    }

    /// Close the publisher's channel. A later publish opens a new one.
    pub async fn close(&self) -> Result<()> {
        let cached = self.channel.lock().await.take();
        if let Some(cached) = cached {
            if !cached.channel.is_closed() {
                cached.channel.close().await?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    async fn cached_channel_id(&self) -> Option<u64> {
        self.channel.lock().await.as_ref().map(|cached| cached.id)
    }
}
