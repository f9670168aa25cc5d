// src/rabbitmq/listener.rs
// Supervises the connection: notices unexpected loss, re-dials, and replays
// the consumer registry onto the new connection. Channel-level failures are
// repaired in place while the connection stays up.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::client::{Client, ClientState};
use super::connection::{ConnectionEvent, Session};
use super::errors::{MessagingError, Result};
use super::reconnect::{retry, signalled, RetryOutcome};

impl Client {
    /// Runs the listener until the client is closed.
    ///
    /// Start it once, in the background, after `setup_publishing` and the
    /// initial consumers:
    ///
    /// ```no_run
    /// # async fn run(client: de_messaging::Client) {
    /// let listener = client.clone();
    /// tokio::spawn(async move { listener.listen().await });
    /// # }
    /// ```
    ///
    /// Returns `Ok(())` after an explicit [`Client::close`]. With reconnection
    /// disabled, or once the retry policy is exhausted, an unexpected
    /// disconnect moves the client to [`ClientState::Disconnected`] and is
    /// returned as an error.
    pub async fn listen(&self) -> Result<()> {
        self.ensure_open()?;
        let mut events = self
            .inner
            .events_rx
            .lock()
            .await
            .take()
            .ok_or(MessagingError::AlreadyListening)?;
        let mut shutdown = self.inner.shutdown.subscribe();

        info!(reconnect = self.inner.options.reconnect, "Listener started");

        let result = loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = signalled(&mut shutdown) => break Ok(()),
            };

            if self.is_closed() {
                break Ok(());
            }

            let event = match event {
                Some(event) => event,
                None => break Ok(()),
            };

            if let Err(e) = self.handle_event(event).await {
                break Err(e);
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Listener stopped");
        } else {
            info!("Listener stopped");
        }
        result
    }

    async fn handle_event(&self, event: ConnectionEvent) -> Result<()> {
        let current = self.inner.generation.load(Ordering::SeqCst);
        match event {
            ConnectionEvent::Lost { generation, reason } => {
                if generation != current {
                    debug!(generation, current, "Ignoring loss of a replaced connection");
                    return Ok(());
                }
                self.connection_lost(generation, &reason).await
            }
            ConnectionEvent::ControlChannelLost { generation, reason } => {
                if generation != current {
                    return Ok(());
                }
                self.control_channel_lost(generation, &reason).await
            }
            ConnectionEvent::ConsumerStopped {
                generation,
                binding_id,
                reason,
            } => {
                if generation != current {
                    return Ok(());
                }
                self.consumer_stopped(generation, binding_id, &reason).await;
                Ok(())
            }
        }
    }

    async fn connection_lost(&self, generation: u64, reason: &str) -> Result<()> {
        warn!(generation, reason, "Connection to broker lost");
        let dropped = self.inner.session.write().await.take();
        if let Some(session) = dropped {
            if let Err(e) = session.close(reason).await {
                debug!(generation, error = %e, "Old connection did not close cleanly");
            }
        }

        if !self.inner.options.reconnect {
            self.set_state(ClientState::Disconnected);
            return Err(MessagingError::ConnectionError(format!(
                "connection lost and reconnection is disabled: {}",
                reason
            )));
        }

        self.reconnect().await
    }

    /// Reopens the control channel on the live connection. Falls back to a
    /// full reconnect if that is impossible.
    async fn control_channel_lost(&self, generation: u64, reason: &str) -> Result<()> {
        let session = match self.inner.session.read().await.clone() {
            Some(session) => session,
            None => return Ok(()),
        };
        if !session.connection.status().connected() {
            // The connection's own error report drives recovery.
            return Ok(());
        }

        warn!(generation, reason, "Control channel lost");
        match session.reopen_channel().await {
            Ok(true) => {
                if let Err(e) = self.redeclare_exchange().await {
                    error!(generation, error = %e, "Failed to re-declare publishing exchange");
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                warn!(generation, error = %e, "Could not reopen control channel");
                self.connection_lost(generation, &e.to_string()).await
            }
        }
    }

    /// Restarts one consumer whose delivery loop ended. A refusal is retried
    /// after the policy's first delay; a connection failure is left to the
    /// connection's own error report.
    async fn consumer_stopped(&self, generation: u64, binding_id: u64, reason: &str) {
        warn!(generation, binding_id, reason, "Consumer stopped; restarting");
        let err = match self.restart_consumer(generation, binding_id).await {
            Ok(()) => return,
            Err(e) => e,
        };
        if err.is_connection_loss() {
            debug!(generation, binding_id, error = %err, "Restart deferred to reconnect");
            return;
        }

        error!(generation, binding_id, error = %err, "Failed to restart consumer");
        let delay = self.inner.options.reconnect_policy.delay(1);
        let events = self.inner.events_tx.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let reason = err.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(delay) => {
                    let _ = events.send(ConnectionEvent::ConsumerStopped {
                        generation,
                        binding_id,
                        reason,
                    });
                }
                _ = signalled(&mut shutdown) => {}
            }
        });
    }

    /// Re-dials according to the policy, then restores the exchange and every
    /// registered consumer. Leaves the client Connected, Closed or
    /// Disconnected.
    async fn reconnect(&self) -> Result<()> {
        self.set_state(ClientState::Reconnecting);
        let mut shutdown = self.inner.shutdown.subscribe();
        let policy = self.inner.options.reconnect_policy.clone();

        let outcome = retry(&policy, &mut shutdown, |attempt| async move {
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!(attempt, generation, "Reconnecting to broker");

            let session = Session::open(
                &self.inner.options.uri,
                self.inner.options.connection_name.as_deref(),
                self.inner.options.connect_timeout,
                generation,
                self.inner.events_tx.clone(),
            )
            .await?;
            let session = Arc::new(session);

            if let Err(e) = self.install_and_replay(session.clone()).await {
                let mut current = self.inner.session.write().await;
                if current
                    .as_ref()
                    .is_some_and(|installed| Arc::ptr_eq(installed, &session))
                {
                    current.take();
                }
                drop(current);
                let _ = session.close("replay failed").await;
                return Err(e);
            }
            Ok(generation)
        })
        .await;

        match outcome {
            RetryOutcome::Done(generation) => {
                if self.is_closed() {
                    return Ok(());
                }
                info!(generation, "Reconnected to broker");
                self.set_state(ClientState::Connected);
                Ok(())
            }
            RetryOutcome::Cancelled => Ok(()),
            RetryOutcome::Exhausted(e) => {
                if self.is_closed() {
                    return Ok(());
                }
                self.set_state(ClientState::Disconnected);
                Err(e)
            }
        }
    }
}
