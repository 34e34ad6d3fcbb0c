// src/env.rs
// Environment-variable configuration, loaded after `.env` when present.

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use dotenv::dotenv;

use crate::config::{
    default_prefetch_count, parse_endpoints, ConnectionConfig, ConsumerSettings, PublisherSettings,
    RabbitConfig,
};

pub const RABBITMQ_URLS: &str = "RABBITMQ_URLS";
pub const RABBITMQ_URL: &str = "RABBITMQ_URL";

/// Read settings from the process environment.
pub fn from_env() -> Result<RabbitConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

/// Build settings from an arbitrary variable source.
pub fn from_lookup<F>(lookup: F) -> Result<RabbitConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let endpoints = match var(RABBITMQ_URLS) {
        Some(urls) => parse_endpoints(&urls),
        None => var(RABBITMQ_URL).map(|url| parse_endpoints(&url)).unwrap_or_default(),
    };
    if endpoints.is_empty() {
        bail!("{} or {} must name at least one broker endpoint", RABBITMQ_URLS, RABBITMQ_URL);
    }

    let queue = var("RABBITMQ_QUEUE").unwrap_or(ConsumerSettings::default().queue);

    let config = RabbitConfig {
        connection: ConnectionConfig {
            endpoints,
            uri: None,
            reconnect_delay_seconds: parsed(&var, "RABBITMQ_RECONNECT_DELAY_SECONDS")?
                .unwrap_or(ConnectionConfig::default().reconnect_delay_seconds),
        },
        consumer: ConsumerSettings {
            queue: queue.clone(),
            auto_ack: flag(&var, "RABBITMQ_AUTO_ACK")?,
            exclusive: flag(&var, "RABBITMQ_EXCLUSIVE")?,
            no_local: flag(&var, "RABBITMQ_NO_LOCAL")?,
            prefetch_count: parsed(&var, "RABBITMQ_PREFETCH_COUNT")?
                .unwrap_or_else(default_prefetch_count),
            prefetch_size: parsed(&var, "RABBITMQ_PREFETCH_SIZE")?.unwrap_or(0),
            prefetch_global: flag(&var, "RABBITMQ_PREFETCH_GLOBAL")?,
            arguments: Default::default(),
        },
        publisher: PublisherSettings {
            exchange: var("RABBITMQ_EXCHANGE").unwrap_or_default(),
            routing_key: var("RABBITMQ_ROUTING_KEY").unwrap_or(queue),
        },
    };
    config.validate()?;
    Ok(config)
}

fn parsed<T, V>(var: &V, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|value| value.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("Invalid value for {}", key))
}

fn flag<V>(var: &V, key: &str) -> Result<bool>
where
    V: Fn(&str) -> Option<String>,
{
    match var(key).map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) => match value.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("Invalid boolean for {}: {}", key, other),
        },
    }
}
