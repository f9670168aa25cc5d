//! Job-control and notification messaging over an AMQP topic exchange.
//!
//! A [`Client`] owns one broker connection. Consumers registered with
//! [`Client::add_consumer`] each get their own channel and delivery loop, and
//! the background [`Client::listen`] loop re-dials and restores all of them
//! after an unexpected disconnect.

pub mod config;
pub mod env;
pub mod keys;
pub mod logging;
pub mod message;
pub mod models;
pub mod rabbitmq;

pub use lapin::{message::Delivery, options, Channel, ExchangeKind};
pub use message::Envelope;
pub use rabbitmq::{
    Client, ClientOptions, ClientState, ConsumerOptions, DeliveryContext, DeliveryHandler,
    MessagingError, ReconnectPolicy, Result,
};
