// src/rabbitmq/testing.rs
//! In-memory broker and log capture shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::types::FieldTable;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use super::amqp_client::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerDialer, CloseNotifier, CloseReason,
    CloseSignal, ConsumeOptions, Delivery, DeliveryStream, OutboundMessage,
};
use super::errors::{RabbitMQError, Result};

/// Poll an (async) condition until it holds or the timeout expires.
macro_rules! eventually {
    ($timeout:expr, $cond:expr) => {
        async {
            let deadline = tokio::time::Instant::now() + $timeout;
            loop {
                if $cond {
                    break true;
                }
                if tokio::time::Instant::now() >= deadline {
                    break false;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        .await
    };
}
pub(crate) use eventually;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckRecord {
    Ack(u64),
    Nack { tag: u64, requeue: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub channel_id: usize,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub message: OutboundMessage,
}

#[derive(Debug, Clone)]
pub struct ConsumeCall {
    pub channel_id: usize,
    pub queue: String,
    pub consumer_tag: String,
    pub options: ConsumeOptions,
    pub arguments: FieldTable,
}

#[derive(Default)]
struct Shared {
    next_channel_id: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    published: Mutex<Vec<PublishedMessage>>,
    publish_failures: Mutex<VecDeque<RabbitMQError>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Result<Delivery>>>>,
    consume_calls: Mutex<Vec<ConsumeCall>>,
    acks: Mutex<Vec<AckRecord>>,
    qos_calls: Mutex<Vec<(u16, u32, bool)>>,
    qos_failures: Mutex<VecDeque<RabbitMQError>>,
    fail_channel_open: AtomicBool,
    stall_channel_open: AtomicBool,
    stall_publishes: AtomicBool,
}

/// Broker double: a set of reachable endpoints plus recorders for every
/// operation the client layer performs.
pub struct MockBroker {
    reachable: Mutex<HashSet<String>>,
    dials: Mutex<Vec<String>>,
    hold_dials: AtomicBool,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    shared: Arc<Shared>,
}

impl MockBroker {
    pub fn with_reachable(endpoints: &[&str]) -> Arc<Self> {
        Arc::new(MockBroker {
            reachable: Mutex::new(endpoints.iter().map(|e| e.to_string()).collect()),
            dials: Mutex::new(Vec::new()),
            hold_dials: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    pub fn dial_log(&self) -> Vec<String> {
        self.dials.lock().unwrap().clone()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.connections.lock().unwrap()[index].clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn channel(&self, index: usize) -> Arc<MockChannel> {
        self.shared.channels.lock().unwrap()[index].clone()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.published.lock().unwrap().clone()
    }

    /// Make the next publish on any channel fail with `error`.
    pub fn fail_next_publish(&self, error: RabbitMQError) {
        self.shared.publish_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_channel_open(&self, fail: bool) {
        self.shared.fail_channel_open.store(fail, Ordering::SeqCst);
    }

    /// Channel opens hang until released, like a half-open broker.
    pub fn stall_channel_open(&self, stall: bool) {
        self.shared.stall_channel_open.store(stall, Ordering::SeqCst);
    }

    /// Publishes hang until released, waiting on a confirm that never comes.
    pub fn stall_publishes(&self, stall: bool) {
        self.shared.stall_publishes.store(stall, Ordering::SeqCst);
    }

    /// Dials are logged but do not complete until released.
    pub fn hold_dials(&self, hold: bool) {
        self.hold_dials.store(hold, Ordering::SeqCst);
    }

    /// Make the next `basic.qos` on any channel fail with `error`.
    pub fn fail_next_qos(&self, error: RabbitMQError) {
        self.shared.qos_failures.lock().unwrap().push_back(error);
    }

    pub fn consume_calls(&self) -> Vec<ConsumeCall> {
        self.shared.consume_calls.lock().unwrap().clone()
    }

    pub fn qos_calls(&self) -> Vec<(u16, u32, bool)> {
        self.shared.qos_calls.lock().unwrap().clone()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        self.shared.acks.lock().unwrap().clone()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.shared
            .consumers
            .lock()
            .unwrap()
            .get(queue)
            .map_or(false, |tx| !tx.is_closed())
    }

    /// Push a message to the active consumer of `queue`. Returns false when
    /// nobody is consuming.
    pub fn deliver(&self, queue: &str, tag: u64, body: &[u8]) -> bool {
        let acker = Arc::new(MockAcker {
            tag,
            shared: self.shared.clone(),
        });
        let delivery = Delivery::new(tag, body.to_vec(), acker)
            .with_message_id(format!("msg-{}", tag))
            .with_route("", queue);
        self.send(queue, Ok(delivery))
    }

    /// Push a stream error to the active consumer of `queue`.
    pub fn deliver_error(&self, queue: &str, error: RabbitMQError) -> bool {
        self.send(queue, Err(error))
    }

    fn send(&self, queue: &str, item: Result<Delivery>) -> bool {
        self.shared
            .consumers
            .lock()
            .unwrap()
            .get(queue)
            .map_or(false, |tx| tx.send(item).is_ok())
    }
}

#[async_trait]
impl BrokerDialer for MockBroker {
    async fn dial(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.dials.lock().unwrap().push(endpoint.to_string());
        wait_while(&self.hold_dials).await;
        if !self.reachable.lock().unwrap().contains(endpoint) {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused: {}",
                endpoint
            )));
        }

        let connection = Arc::new(MockConnection {
            endpoint: endpoint.to_string(),
            notifier: CloseNotifier::new(),
            channels: Mutex::new(Vec::new()),
            shared: self.shared.clone(),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub struct MockConnection {
    endpoint: String,
    notifier: CloseNotifier,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    shared: Arc<Shared>,
}

impl MockConnection {
    /// Simulate the broker tearing the connection down.
    pub fn drop_from_broker(&self, reason: &str) {
        self.shut(CloseReason::Error(reason.to_string()));
    }

    fn shut(&self, reason: CloseReason) {
        self.notifier.fire(reason.clone());
        for channel in self.channels.lock().unwrap().iter() {
            channel.notifier.fire(reason.clone());
        }
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(RabbitMQError::ConnectionClosed(self.endpoint.clone()));
        }
        if self.shared.fail_channel_open.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError("channel open refused".into()));
        }
        wait_while(&self.shared.stall_channel_open).await;

        let channel = Arc::new(MockChannel {
            id: self.shared.next_channel_id.fetch_add(1, Ordering::SeqCst),
            notifier: CloseNotifier::new(),
            shared: self.shared.clone(),
        });
        self.channels.lock().unwrap().push(channel.clone());
        self.shared.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.shut(CloseReason::Graceful);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_fired()
    }

    fn notify_close(&self) -> CloseSignal {
        self.notifier.subscribe()
    }
}

pub struct MockChannel {
    pub id: usize,
    notifier: CloseNotifier,
    shared: Arc<Shared>,
}

impl MockChannel {
    /// Simulate the broker closing this channel.
    pub fn drop_from_broker(&self, reason: &str) {
        self.notifier.fire(CloseReason::Error(reason.to_string()));
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn close(&self) -> Result<()> {
        self.notifier.fire(CloseReason::Graceful);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.notifier.is_fired()
    }

    fn notify_close(&self) -> CloseSignal {
        self.notifier.subscribe()
    }

    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        if self.is_closed() {
            return Err(RabbitMQError::ChannelClosed(format!("channel {}", self.id)));
        }
        let scripted = self.shared.qos_failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        self.shared
            .qos_calls
            .lock()
            .unwrap()
            .push((prefetch_count, prefetch_size, global));
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
        if self.is_closed() {
            return Err(RabbitMQError::ChannelClosed(format!("channel {}", self.id)));
        }
        let scripted = self.shared.publish_failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            if error.is_channel_closed() {
                self.notifier.fire(CloseReason::Error(error.to_string()));
            }
            return Err(error);
        }
        wait_while(&self.shared.stall_publishes).await;

        self.shared.published.lock().unwrap().push(PublishedMessage {
            channel_id: self.id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            immediate,
            message,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream> {
        if self.is_closed() {
            return Err(RabbitMQError::ChannelClosed(format!("channel {}", self.id)));
        }
        self.shared.consume_calls.lock().unwrap().push(ConsumeCall {
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            options,
            arguments,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .consumers
            .lock()
            .unwrap()
            .insert(queue.to_string(), tx);

        let deliveries = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(deliveries
            .take_until(self.notifier.subscribe().closed())
            .boxed())
    }
}

async fn wait_while(flag: &AtomicBool) {
    while flag.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

struct MockAcker {
    tag: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledger for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.shared.acks.lock().unwrap().push(AckRecord::Ack(self.tag));
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.shared.acks.lock().unwrap().push(AckRecord::Nack {
            tag: self.tag,
            requeue,
        });
        Ok(())
    }
}

/// Records formatted events for the current thread while alive.
pub struct CapturedLogs {
    lines: Arc<Mutex<Vec<String>>>,
    _guard: DefaultGuard,
}

impl CapturedLogs {
    pub fn install() -> Self {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(CaptureLayer {
            lines: lines.clone(),
        });
        CapturedLogs {
            lines,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn contains(&self, level: &str, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|line| line.starts_with(level) && line.contains(needle))
    }
}

struct CaptureLayer {
    lines: Arc<Mutex<Vec<String>>>,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = event.metadata().level().to_string();
        event.record(&mut FieldWriter(&mut line));
        self.lines.lock().unwrap().push(line);
    }
}

struct FieldWriter<'a>(&'a mut String);

impl Visit for FieldWriter<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let _ = write!(self.0, " {}={:?}", field.name(), value);
    }
}
