// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("AMQP connection error: {0}")]
    ConnectionError(String),

    #[error("AMQP channel error: {0}")]
    ChannelError(String),

    #[error("AMQP exchange error: {0}")]
    ExchangeError(String),

    #[error("AMQP publish error: {0}")]
    PublishError(String),

    #[error("AMQP queue error: {0}")]
    QueueError(String),

    #[error("AMQP consume error: {0}")]
    ConsumeError(String),

    #[error("client has been closed")]
    ClosedError,

    #[error("listener is already running for this client")]
    AlreadyListening,

    #[error("message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("operation timed out: {0}")]
    TimeoutError(String),
}

// Custom Result type for messaging operations
pub type Result<T> = std::result::Result<T, MessagingError>;

impl MessagingError {
    /// True for errors that come from losing the connection rather than from
    /// a broker refusing a particular command.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionError(_)
                | MessagingError::TimeoutError(_)
                | MessagingError::ClosedError
        )
    }
}

// Converting from lapin errors when the call site has no better category.
impl From<LapinError> for MessagingError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::IOError(_)
            | LapinError::InvalidConnectionState(_)
            | LapinError::MissingHeartbeatError
            | LapinError::InvalidProtocolVersion(_) => {
                MessagingError::ConnectionError(error.to_string())
            }
            _ => MessagingError::ChannelError(error.to_string()),
        }
    }
}

impl From<Elapsed> for MessagingError {
    fn from(_: Elapsed) -> Self {
        MessagingError::TimeoutError("deadline elapsed".to_string())
    }
}

/// Reports whether the broker answered with 404 NOT_FOUND, which is how a
/// passive declare says the queue does not exist.
pub(crate) fn is_not_found(error: &LapinError) -> bool {
    match error {
        LapinError::ProtocolError(amqp) => {
            matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
        }
        other => other.to_string().contains("NOT_FOUND"),
    }
}
