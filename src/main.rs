use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use resilient_rabbitmq::config::{self, RabbitConfig, CONFIG_FILE_NAME};
use resilient_rabbitmq::env;
use resilient_rabbitmq::message::Event;
use resilient_rabbitmq::rabbitmq::{
    ConnectionSupervisor, Consumer, Delivery, LapinDialer, Publisher,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct Heartbeat {
    sequence: u64,
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Some(path) = init_config_target() {
        return config::create_default_config_file(Path::new(&path));
    }

    let settings = load_settings()?;
    let supervisor = Arc::new(
        ConnectionSupervisor::new(settings.endpoints(), Arc::new(LapinDialer::new()))
            .with_reconnect_delay(settings.reconnect_delay()),
    );
    supervisor
        .connect()
        .await
        .context("Failed to connect to any RabbitMQ endpoint")?;
    supervisor.start();

    let token = CancellationToken::new();
    let consumer = Consumer::new(supervisor.clone(), settings.consumer.to_consumer_config()?);
    let queue = settings.consumer.queue.clone();
    let consumer_token = token.clone();
    let consumer_task = tokio::spawn(async move {
        consumer.consume(&consumer_token, &queue, log_delivery).await;
    });

    let publisher = Arc::new(Publisher::new(supervisor.clone()));
    let publisher_task = tokio::spawn(publish_heartbeats(
        publisher.clone(),
        settings.clone(),
        token.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    token.cancel();
    for task in [consumer_task, publisher_task] {
        if let Err(err) = task.await {
            error!("Worker task failed: {}", err);
        }
    }
    if let Err(err) = publisher.close().await {
        warn!("Failed to close publisher channel: {}", err);
    }
    supervisor.shutdown().await?;
    info!("Stopped");
    Ok(())
}

/// `resilient-rabbitmq init-config [path]` writes a starter settings file.
fn init_config_target() -> Option<String> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("init-config") => Some(args.next().unwrap_or_else(|| CONFIG_FILE_NAME.to_string())),
        _ => None,
    }
}

fn load_settings() -> Result<RabbitConfig> {
    match config::find_config_file() {
        Ok(path) => {
            info!("Loading settings from {}", path.display());
            config::load_config_from(&path)
        }
        Err(_) => {
            info!("No settings file found, reading environment");
            env::from_env()
        }
    }
}

async fn log_delivery(_token: CancellationToken, delivery: Delivery) -> Result<()> {
    info!(
        delivery_tag = delivery.delivery_tag,
        message_id = ?delivery.message_id,
        redelivered = delivery.redelivered,
        "Received {} bytes: {}",
        delivery.data.len(),
        String::from_utf8_lossy(&delivery.data)
    );
    Ok(())
}

async fn publish_heartbeats(publisher: Arc<Publisher>, settings: RabbitConfig, token: CancellationToken) {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut sequence = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        sequence += 1;

        let heartbeat = Heartbeat { sequence, host: host.clone() };
        let event = match Event::json(
            &settings.publisher.exchange,
            &settings.publisher.routing_key,
            &heartbeat,
        ) {
            Ok(event) => event,
            Err(err) => {
                error!("Failed to encode heartbeat: {}", err);
                continue;
            }
        };
        if let Err(err) = publisher.publish(&event).await {
            warn!(sequence, "Heartbeat publish failed: {}", err);
        }
    }
}
