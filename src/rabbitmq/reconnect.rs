// src/rabbitmq/reconnect.rs
// Retry policy used by the listener when the broker connection drops.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use super::errors::MessagingError;

/// Shape of the delay between two reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How many reconnect attempts are made before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRetries {
    Unbounded,
    Limited(u32),
}

impl MaxRetries {
    /// `0` means "never give up", matching the environment variable convention.
    pub fn from_count(count: u32) -> Self {
        if count == 0 {
            MaxRetries::Unbounded
        } else {
            MaxRetries::Limited(count)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: MaxRetries,
    /// Spread each delay by +/-15%.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_retries: MaxRetries::Unbounded,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed,
            initial_delay: delay,
            max_delay: delay,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: MaxRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after the given failed attempt (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << exponent;
                self.initial_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let millis = base.as_millis() as f64;
        let jitter = (rand::random::<f64>() * 0.3 - 0.15) * millis;
        Duration::from_millis((millis + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        match self.max_retries {
            MaxRetries::Unbounded => true,
            MaxRetries::Limited(max) => attempts < max,
        }
    }
}

#[derive(Debug)]
pub(crate) enum RetryOutcome<T> {
    Done(T),
    Exhausted(MessagingError),
    Cancelled,
}

/// Runs `attempt` until it succeeds, the policy gives up, or `shutdown` flips.
///
/// The closure receives the 1-based attempt number. A shutdown signal
/// interrupts both a running attempt and the wait between attempts; an
/// interrupted attempt is dropped.
pub(crate) async fn retry<T, F, Fut>(
    policy: &ReconnectPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut attempt: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, MessagingError>>,
{
    let mut attempts = 0u32;
    loop {
        if *shutdown.borrow() {
            return RetryOutcome::Cancelled;
        }

        attempts += 1;
        let result = tokio::select! {
            result = attempt(attempts) => result,
            _ = signalled(shutdown) => return RetryOutcome::Cancelled,
        };
        let err = match result {
            Ok(value) => return RetryOutcome::Done(value),
            Err(err) => err,
        };

        if *shutdown.borrow() {
            return RetryOutcome::Cancelled;
        }
        if !policy.allows(attempts) {
            warn!(attempt = attempts, error = %err, "Giving up after maximum reconnect attempts");
            return RetryOutcome::Exhausted(err);
        }

        let wait = policy.delay(attempts);
        warn!(attempt = attempts, error = %err, "Reconnect attempt failed");
        info!("Waiting {}ms before next reconnect attempt", wait.as_millis());

        tokio::select! {
            _ = sleep(wait) => {}
            _ = signalled(shutdown) => return RetryOutcome::Cancelled,
        }
    }
}

/// Resolves once `shutdown` reads true or its sender is gone.
pub(crate) async fn signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
