use std::env;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;

use crate::config::{
    default_connect_timeout, default_exchange, default_exchange_type, default_shutdown_grace, ConnectionConfig, MessagingConfig, PublishingConfig,
    ReconnectConfig,
};
use crate::rabbitmq::Backoff;

pub const AMQP_URI: &str = "AMQP_URI";
pub const AMQP_EXCHANGE: &str = "AMQP_EXCHANGE";
pub const AMQP_EXCHANGE_TYPE: &str = "AMQP_EXCHANGE_TYPE";
pub const AMQP_RECONNECT: &str = "AMQP_RECONNECT";
pub const AMQP_CONNECTION_NAME: &str = "AMQP_CONNECTION_NAME";
pub const AMQP_CONNECT_TIMEOUT_MS: &str = "AMQP_CONNECT_TIMEOUT_MS";
pub const AMQP_RECONNECT_BACKOFF: &str = "AMQP_RECONNECT_BACKOFF";
pub const AMQP_RECONNECT_DELAY_MS: &str = "AMQP_RECONNECT_DELAY_MS";
pub const AMQP_RECONNECT_MAX_DELAY_MS: &str = "AMQP_RECONNECT_MAX_DELAY_MS";
pub const AMQP_RECONNECT_MAX_RETRIES: &str = "AMQP_RECONNECT_MAX_RETRIES";

/// Loads `.env` if present, then builds the configuration from the process
/// environment.
pub fn from_env() -> Result<MessagingConfig> {
    dotenv().ok();
    from_lookup(|key| env::var(key).ok())
}

/// Builds the configuration from any key lookup.
pub fn from_lookup<F>(lookup: F) -> Result<MessagingConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let uri = lookup(AMQP_URI).ok_or_else(|| anyhow!("{} must be set", AMQP_URI))?;
    let defaults = ReconnectConfig::default();

    let config = MessagingConfig {
        connection: ConnectionConfig {
            uri,
            reconnect: parse_or(&lookup, AMQP_RECONNECT, true)?,
            connection_name: lookup(AMQP_CONNECTION_NAME),
            shutdown_grace_ms: default_shutdown_grace(),
            connect_timeout_ms: parse_or(&lookup, AMQP_CONNECT_TIMEOUT_MS, default_connect_timeout())?,
        },
        reconnect: ReconnectConfig {
            backoff: match lookup(AMQP_RECONNECT_BACKOFF) {
                Some(value) => parse_backoff(&value)?,
                None => defaults.backoff,
            },
            delay_ms: parse_or(&lookup, AMQP_RECONNECT_DELAY_MS, defaults.delay_ms)?,
            max_delay_ms: parse_or(&lookup, AMQP_RECONNECT_MAX_DELAY_MS, defaults.max_delay_ms)?,
            max_retries: parse_or(&lookup, AMQP_RECONNECT_MAX_RETRIES, defaults.max_retries)?,
            jitter: defaults.jitter,
        },
        publishing: PublishingConfig {
            exchange: lookup(AMQP_EXCHANGE).unwrap_or_else(default_exchange),
            exchange_type: lookup(AMQP_EXCHANGE_TYPE).unwrap_or_else(default_exchange_type),
        },
    };

    config.validate()?;
    Ok(config)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, value)),
        None => Ok(default),
    }
}

fn parse_backoff(value: &str) -> Result<Backoff> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(Backoff::Fixed),
        "exponential" => Ok(Backoff::Exponential),
        other => Err(anyhow!(
            "Invalid value for {}: {:?} (expected fixed or exponential)",
            AMQP_RECONNECT_BACKOFF,
            other
        )),
    }
}
