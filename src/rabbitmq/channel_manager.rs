// src/rabbitmq/channel_manager.rs
// Exchange and queue management on top of the current session.

use lapin::{
    options::{
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::FieldTable,
    Channel, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::client::{Client, PublishingExchange};
use super::errors::{is_not_found, MessagingError, Result};

/// Maps a configured exchange type onto the AMQP kind.
pub fn parse_exchange_kind(kind: &str) -> ExchangeKind {
    match kind.to_ascii_lowercase().as_str() {
        "topic" => ExchangeKind::Topic,
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(kind.to_string()),
    }
}

/// Configuration applied to a channel before a consumer starts on it.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,
}

impl ChannelConfig {
    pub(crate) async fn apply(&self, channel: &Channel) -> Result<()> {
        debug!(channel_id = channel.id(), "Setting channel QoS to {}", self.prefetch_count);
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::ChannelError(format!("Failed to set QoS: {}", e)))
    }
}

pub(crate) async fn declare_exchange(
    channel: &Channel,
    name: &str,
    kind: ExchangeKind,
) -> Result<()> {
    channel
        .exchange_declare(
            name,
            kind,
            ExchangeDeclareOptions {
                durable: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::ExchangeError(format!("Failed to declare exchange {}: {}", name, e)))
}

pub(crate) async fn declare_and_bind(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    binding_key: &str,
    durable: bool,
    auto_delete: bool,
) -> Result<()> {
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable,
                auto_delete,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::QueueError(format!("Failed to declare queue {}: {}", queue, e)))?;

    debug!(
        queue,
        messages = declared.message_count(),
        consumers = declared.consumer_count(),
        "Queue declared"
    );

    channel
        .queue_bind(
            queue,
            exchange,
            binding_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| MessagingError::QueueError(format!("Failed to bind queue {}: {}", queue, e)))
}

impl Client {
    /// Declares the durable topic exchange used by every publish from this
    /// client. Safe to call again; the listener repeats it after a reconnect.
    pub async fn setup_publishing(&self, exchange: &str) -> Result<()> {
        self.setup_publishing_with_kind(exchange, ExchangeKind::Topic).await
    }

    pub async fn setup_publishing_with_kind(&self, exchange: &str, kind: ExchangeKind) -> Result<()> {
        let session = self.current_session().await?;
        declare_exchange(&session.channel().await, exchange, kind.clone()).await?;

        *self.inner.exchange.write().await = Some(PublishingExchange {
            name: exchange.to_string(),
            kind,
        });
        info!(exchange, "Publishing exchange declared");
        Ok(())
    }

    /// Declares the publishing exchange again on a throwaway channel, so a
    /// refusal can't take the control channel down with it.
    pub(crate) async fn redeclare_exchange(&self) -> Result<()> {
        let exchange = self.inner.exchange.read().await.clone();
        if let Some(exchange) = exchange {
            let session = self.current_session().await?;
            let channel = session.create_channel().await?;
            let declared = declare_exchange(&channel, &exchange.name, exchange.kind).await;
            release_channel(&channel, &exchange.name, "exchange re-declared").await;
            declared?;
            debug!(exchange = %exchange.name, "Publishing exchange re-declared");
        }
        Ok(())
    }

    /// Declares `name`, binds it to `exchange` with `binding_key` and hands back
    /// the channel that did it, for direct inspection. The caller owns the
    /// returned channel and should close it when done.
    pub async fn create_queue(
        &self,
        name: &str,
        exchange: &str,
        binding_key: &str,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Channel> {
        let session = self.current_session().await?;
        let channel = session.create_channel().await?;
        if let Err(e) = declare_and_bind(&channel, name, exchange, binding_key, durable, auto_delete).await {
            release_channel(&channel, name, "queue create failed").await;
            return Err(e);
        }
        info!(queue = name, exchange, binding_key, "Queue created");
        Ok(channel)
    }

    /// Passive declare: tells whether the queue exists without creating it.
    pub async fn queue_exists(&self, name: &str, durable: bool, auto_delete: bool) -> Result<bool> {
        let session = self.current_session().await?;
        // A failed passive declare kills the channel, so use a throwaway one.
        let channel = session.create_channel().await?;

        let result = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    durable,
                    auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        let exists = match result {
            Ok(_) => true,
            Err(e) if is_not_found(&e) => false,
            Err(e) => {
                release_channel(&channel, name, "queue check failed").await;
                return Err(MessagingError::QueueError(format!(
                    "Failed to check queue {}: {}",
                    name, e
                )));
            }
        };

        release_channel(&channel, name, "queue check done").await;
        debug!(queue = name, exists, "Queue existence checked");
        Ok(exists)
    }

    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        let session = self.current_session().await?;
        let channel = session.create_channel().await?;

        // The broker treats deleting a missing queue as a no-op; callers get an error.
        let passive = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match channel.queue_declare(name, passive, FieldTable::default()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                return Err(MessagingError::QueueError(format!("Queue {} does not exist", name)))
            }
            Err(e) => {
                release_channel(&channel, name, "queue delete failed").await;
                return Err(MessagingError::QueueError(format!(
                    "Failed to delete queue {}: {}",
                    name, e
                )));
            }
        }

        let deleted = channel.queue_delete(name, QueueDeleteOptions::default()).await;
        release_channel(&channel, name, "queue delete done").await;
        let purged = deleted
            .map_err(|e| MessagingError::QueueError(format!("Failed to delete queue {}: {}", name, e)))?;

        info!(queue = name, purged, "Queue deleted");
        Ok(())
    }
}

/// Closes a throwaway management channel unless the broker already did.
async fn release_channel(channel: &Channel, name: &str, reason: &str) {
    if !channel.status().connected() {
        return;
    }
    if let Err(e) = channel.close(200, reason).await {
        warn!(name, error = %e, "Failed to close management channel");
    }
}
