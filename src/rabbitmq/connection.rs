// src/rabbitmq/connection.rs
// One broker session: the connection, its control channel and a generation
// number that tells events from a replaced connection apart.

use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::errors::{MessagingError, Result};

/// Something the listener needs to react to. Each event carries the
/// generation of the session it came from.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// The connection itself failed.
    Lost { generation: u64, reason: String },
    /// The broker closed the control channel; the connection may still be up.
    ControlChannelLost { generation: u64, reason: String },
    /// A delivery loop ended without a shutdown, e.g. its queue was deleted.
    ConsumerStopped {
        generation: u64,
        binding_id: u64,
        reason: String,
    },
}

pub(crate) fn connection_properties(connection_name: Option<&str>) -> ConnectionProperties {
    let properties = ConnectionProperties::default();
    match connection_name {
        Some(name) => properties.with_connection_name(name.to_string().into()),
        None => properties,
    }
}

pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) connection: Connection,
    channel: RwLock<Channel>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Session {
    /// Dials the broker and opens the control channel. Never retries; a failed
    /// or timed-out dial is reported straight back to the caller.
    pub(crate) async fn open(
        uri: &str,
        connection_name: Option<&str>,
        connect_timeout: Duration,
        generation: u64,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        info!(generation, "Attempting to connect to AMQP broker");

        let connection = timeout(
            connect_timeout,
            Connection::connect(uri, connection_properties(connection_name)),
        )
        .await?
        .map_err(|e| MessagingError::ConnectionError(format!("Failed to connect: {}", e)))?;

        let connection_events = events.clone();
        connection.on_error(move |err| {
            warn!(generation, error = %err, "AMQP connection reported an error");
            // The listener may already be gone after close; nothing to do then.
            let _ = connection_events.send(ConnectionEvent::Lost {
                generation,
                reason: err.to_string(),
            });
        });

        let channel = open_control_channel(&connection, generation, &events).await?;
        info!(generation, "Successfully connected to AMQP broker");

        Ok(Self {
            generation,
            connection,
            channel: RwLock::new(channel),
            events,
        })
    }

    /// The current control channel. Cheap to clone; don't keep it past one
    /// operation since it is replaced after a channel-level failure.
    pub(crate) async fn channel(&self) -> Channel {
        self.channel.read().await.clone()
    }

    pub(crate) async fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.read().await.status().connected()
    }

    /// Replaces the control channel if it has been closed. Returns whether a
    /// new one was opened.
    pub(crate) async fn reopen_channel(&self) -> Result<bool> {
        let mut channel = self.channel.write().await;
        if channel.status().connected() {
            return Ok(false);
        }
        *channel = open_control_channel(&self.connection, self.generation, &self.events).await?;
        info!(generation = self.generation, channel_id = channel.id(), "Control channel reopened");
        Ok(true)
    }

    pub(crate) async fn create_channel(&self) -> Result<Channel> {
        if !self.connection.status().connected() {
            return Err(MessagingError::ConnectionError(
                "connection is not open".to_string(),
            ));
        }
        self.connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::ChannelError(e.to_string()))
    }

    /// Releases the control channel, then the connection.
    pub(crate) async fn close(&self, reason: &str) -> Result<()> {
        let channel = self.channel().await;
        if channel.status().connected() {
            if let Err(e) = channel.close(200, reason).await {
                warn!(generation = self.generation, error = %e, "Failed to close control channel");
            }
        }

        if self.connection.status().connected() {
            self.connection.close(200, reason).await.map_err(|e| {
                error!(generation = self.generation, error = %e, "Failed to close connection");
                MessagingError::ConnectionError(e.to_string())
            })?;
        }

        info!(generation = self.generation, "AMQP session closed");
        Ok(())
    }
}

async fn open_control_channel(
    connection: &Connection,
    generation: u64,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) -> Result<Channel> {
    let channel = connection.create_channel().await.map_err(|e| {
        MessagingError::ChannelError(format!("Failed to create control channel: {}", e))
    })?;

    let channel_events = events.clone();
    let channel_id = channel.id();
    channel.on_error(move |err| {
        warn!(generation, channel_id, error = %err, "Control channel closed");
        let _ = channel_events.send(ConnectionEvent::ControlChannelLost {
            generation,
            reason: err.to_string(),
        });
    });

    debug!(generation, channel_id, "Control channel opened");
    Ok(channel)
}
