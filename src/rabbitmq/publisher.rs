use lapin::{options::BasicPublishOptions, types::ShortString, BasicProperties};
use tracing::{debug, info};
use uuid::Uuid;

use super::client::Client;
use super::errors::{MessagingError, Result};
use crate::keys;
use crate::message::{
    EmailRequest, Envelope, JobRequest, StopRequest, TimeLimitDelta, TimeLimitRequest,
    TimeLimitResponse, UpdateMessage, WrappedNotificationMessage,
};

const PERSISTENT: u8 = 2;

impl Client {
    /// Sends `payload` to the publishing exchange with `routing_key`.
    ///
    /// Fire-and-forget: the broker's confirmation is not awaited. Fails if
    /// `setup_publishing` hasn't been called or the channel is gone.
    pub async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let exchange = self
            .inner
            .exchange
            .read()
            .await
            .as_ref()
            .map(|exchange| exchange.name.clone())
            .ok_or_else(|| MessagingError::PublishError("no exchange has been declared".to_string()))?;

        let session = self.current_session().await.map_err(|e| match e {
            MessagingError::ClosedError => e,
            other => MessagingError::PublishError(other.to_string()),
        })?;
        if !session.is_connected().await {
            return Err(MessagingError::PublishError("channel is not open".to_string()));
        }
        let channel = session.channel().await;

        let properties = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_delivery_mode(PERSISTENT)
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        channel
            .basic_publish(
                &exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| MessagingError::PublishError(e.to_string()))?;

        debug!(
            exchange = %exchange,
            routing_key,
            bytes = payload.len(),
            "Published message"
        );
        Ok(())
    }

    async fn publish_envelope<E: Envelope>(&self, routing_key: &str, envelope: &E) -> Result<()> {
        let payload = envelope.to_payload()?;
        self.publish(routing_key, &payload).await
    }

    pub async fn publish_job_request(&self, request: &JobRequest) -> Result<()> {
        self.publish_envelope(keys::LAUNCHES_KEY, request).await
    }

    /// Stamps `SentOn` with the current time in epoch milliseconds, then sends
    /// the update.
    pub async fn publish_job_update(&self, update: &mut UpdateMessage) -> Result<()> {
        update.sent_on = chrono::Utc::now().timestamp_millis().to_string();
        self.publish_envelope(keys::UPDATES_KEY, update).await
    }

    pub async fn publish_email_request(&self, request: &EmailRequest) -> Result<()> {
        self.publish_envelope(keys::EMAIL_REQUEST_PUBLISHING_KEY, request).await
    }

    pub async fn publish_notification_message(
        &self,
        notification: &WrappedNotificationMessage,
    ) -> Result<()> {
        let key = keys::notification_key(&notification.message.user);
        self.publish_envelope(&key, notification).await
    }

    pub async fn send_time_limit_request(&self, invocation_id: &str) -> Result<()> {
        let request = TimeLimitRequest {
            invocation_id: invocation_id.to_string(),
        };
        self.publish_envelope(&keys::time_limit_request_key(invocation_id), &request)
            .await
    }

    pub async fn send_time_limit_response(
        &self,
        invocation_id: &str,
        milliseconds_remaining: i64,
    ) -> Result<()> {
        let response = TimeLimitResponse {
            invocation_id: invocation_id.to_string(),
            milliseconds_remaining,
        };
        self.publish_envelope(&keys::time_limit_responses_key(invocation_id), &response)
            .await
    }

    pub async fn send_time_limit_delta(&self, invocation_id: &str, delta: &str) -> Result<()> {
        let delta = TimeLimitDelta {
            invocation_id: invocation_id.to_string(),
            delta: delta.to_string(),
        };
        self.publish_envelope(&keys::time_limit_delta_request_key(invocation_id), &delta)
            .await
    }

    pub async fn send_stop_request(
        &self,
        invocation_id: &str,
        username: &str,
        reason: &str,
    ) -> Result<()> {
        let request = StopRequest {
            invocation_id: invocation_id.to_string(),
            username: username.to_string(),
            reason: reason.to_string(),
            ..StopRequest::new()
        };
        self.publish_envelope(&keys::stop_request_key(invocation_id), &request)
            .await?;
        info!(invocation_id, username, "Sent stop request");
        Ok(())
    }
}
