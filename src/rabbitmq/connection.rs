// src/rabbitmq/connection.rs

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use url::Url;

use super::amqp_client::{BrokerConnection, BrokerDialer};
use super::errors::{RabbitMQError, Result};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Owns the single logical broker connection.
///
/// [`connect`](Self::connect) fails over across the configured endpoints in
/// order. Once [`start`](Self::start) has been called, a background watcher
/// reconnects whenever the active connection closes, retrying forever with a
/// fixed delay until [`shutdown`](Self::shutdown).
pub struct ConnectionSupervisor {
    endpoints: Vec<String>,
    dialer: Arc<dyn BrokerDialer>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
    reconnect_delay: Duration,
    span: Span,
}

impl ConnectionSupervisor {
    pub fn new(endpoints: Vec<String>, dialer: Arc<dyn BrokerDialer>) -> Self {
        ConnectionSupervisor {
            endpoints,
            dialer,
            connection: RwLock::new(None),
            shutdown: CancellationToken::new(),
            watcher: Mutex::new(None),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            span: info_span!("connection_supervisor"),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Attach log output of this supervisor and its watcher to `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Dial each endpoint in order and keep the first that answers. Any
    /// previous connection is closed. An empty endpoint list is accepted and
    /// leaves the supervisor without a connection.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with_failover()
            .instrument(self.span.clone())
            .await
    }

    async fn connect_with_failover(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            warn!("No RabbitMQ endpoints configured, nothing to connect to");
            return Ok(());
        }

        let mut last_error = None;
        for (attempt, endpoint) in self.endpoints.iter().enumerate() {
            info!(
                endpoint = %redact_endpoint(endpoint),
                "Attempting to connect to RabbitMQ ({}/{})",
                attempt + 1,
                self.endpoints.len()
            );

            match self.dialer.dial(endpoint).await {
                Ok(connection) => {
                    self.install(connection).await?;
                    info!(endpoint = %redact_endpoint(endpoint), "Successfully connected to RabbitMQ");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        endpoint = %redact_endpoint(endpoint),
                        error = %err,
                        "Failed to connect to RabbitMQ endpoint"
                    );
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn install(&self, connection: Arc<dyn BrokerConnection>) -> Result<()> {
        let previous = {
            let mut guard = self.connection.write().await;
            // Checked under the lock so shutdown cannot miss a late dial
            if self.shutdown.is_cancelled() {
                drop(guard);
                close_quietly(connection.as_ref()).await;
                return Err(RabbitMQError::Terminated);
            }
            guard.replace(connection)
        };

        if let Some(previous) = previous {
            if !previous.is_closed() {
                debug!(endpoint = %redact_endpoint(previous.endpoint()), "Closing previous connection");
                close_quietly(previous.as_ref()).await;
            }
        }
        Ok(())
    }

    /// Current connection handle. It may already be closed while a reconnect
    /// is in progress.
    pub async fn get_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .map_or(false, |conn| !conn.is_closed())
    }

    /// Launch the background reconnect watcher. Only the first call has any
    /// effect.
    pub fn start(self: &Arc<Self>) {
        let mut watcher = match self.watcher.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if watcher.is_some() || self.shutdown.is_cancelled() {
            warn!(parent: &self.span, "Reconnect watcher already started or supervisor shut down");
            return;
        }

        let supervisor = Arc::clone(self);
        *watcher = Some(tokio::spawn(
            supervisor.watch_connection().instrument(self.span.clone()),
        ));
    }

    async fn watch_connection(self: Arc<Self>) {
        debug!("Reconnect watcher started");
        loop {
            let connection = match self.get_connection().await {
                Some(connection) => connection,
                None => {
                    // Nothing to watch until someone calls connect()
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(self.reconnect_delay) => {}
                    }
                    continue;
                }
            };

            let closed = connection.notify_close();
            let reason = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                reason = closed.closed() => reason,
            };

            if self.is_connected().await {
                debug!("Connection was replaced, resubscribing");
                continue;
            }

            warn!(
                endpoint = %redact_endpoint(connection.endpoint()),
                reason = %reason,
                "RabbitMQ connection lost, reconnecting"
            );
            drop(connection);

            if !self.reconnect().await {
                break;
            }
        }
        debug!("Reconnect watcher stopped");
    }

    /// Retry failover until it succeeds (true) or shutdown is requested (false).
    async fn reconnect(&self) -> bool {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                result = self.connect_with_failover() => result,
            };

            match result {
                Ok(()) => {
                    info!(attempt, "Reconnected to RabbitMQ");
                    return true;
                }
                Err(RabbitMQError::Terminated) => return false,
                Err(err) => {
                    error!(
                        attempt,
                        error = %err,
                        "Reconnect attempt failed, retrying in {:?}",
                        self.reconnect_delay
                    );
                }
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return false,
                _ = sleep(self.reconnect_delay) => {}
            }
        }
    }

    /// Stop the watcher and close the active connection. Calling it again is
    /// a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let watcher = match self.watcher.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(watcher) = watcher {
            if let Err(err) = watcher.await {
                error!(parent: &self.span, error = %err, "Reconnect watcher panicked");
            }
        }

        let connection = self.connection.write().await.take();
        if let Some(conn) = connection {
            info!(parent: &self.span, "Closing RabbitMQ connection gracefully");
            if !conn.is_closed() {
                conn.close().await?;
            }
        }
        Ok(())
    }
}

async fn close_quietly(connection: &dyn BrokerConnection) {
    if let Err(err) = connection.close().await {
        warn!(error = %err, "Failed to close RabbitMQ connection");
    }
}

/// Hide the password part of an AMQP URI before it reaches the logs.
pub fn redact_endpoint(endpoint: &str) -> String {
    let Ok(mut url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    if url.password().is_some() && url.set_password(Some("***")).is_err() {
        return endpoint.to_string();
    }
    url.to_string()
}
