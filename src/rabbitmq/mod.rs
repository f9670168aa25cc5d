// src/rabbitmq/mod.rs
// AMQP client: one connection, a consumer registry and a reconnecting listener.

pub mod errors;
pub mod reconnect;

mod channel_manager;
mod client;
mod connection;
mod consumer;
mod listener;
mod publisher;

pub use channel_manager::{parse_exchange_kind, ChannelConfig};
pub use client::{Client, ClientOptions, ClientState};
pub use consumer::{ConsumerBinding, ConsumerOptions, DeliveryContext, DeliveryHandler};
pub use errors::{MessagingError, Result};
pub use reconnect::{Backoff, MaxRetries, ReconnectPolicy};
