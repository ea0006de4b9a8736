//! # Rejoin
//!
//! Keeps a group member in the consumer group: every retryable failure of
//! `join()` is followed by a back-off and another `join()`.
use std::cmp::min;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ListenerError;
use crate::metrics_consts::REJOIN_ATTEMPTS;

/// Anything that can take part in the consumer group.
#[async_trait]
pub trait GroupMember: Send + Sync {
    /// Blocks until `shutdown` fires (`Ok`) or membership fails (`Err`).
    async fn join(&self, shutdown: &CancellationToken) -> Result<(), ListenerError>;
}

/// Decides how long to wait before the next `join()`.
pub trait RejoinStrategy: Send + Sync {
    /// `attempt` counts failed joins so far, starting at 1. `None` gives up.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

#[derive(Clone, Debug)]
/// Exponential back-off between rejoins.
pub struct RejoinPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first rejoin.
    pub initial_interval: Duration,
    /// The maximum possible backoff between rejoins.
    pub maximum_interval: Duration,
    /// Give up after this many failed joins. Unbounded when `None`.
    pub max_attempts: Option<u32>,
}

impl RejoinPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts,
        }
    }

    /// Determine interval for rejoining at a given attempt number.
    pub fn interval(&self, attempt: u32) -> Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(self.maximum_interval);

        min(candidate, self.maximum_interval)
    }
}

impl Default for RejoinPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1), Duration::from_secs(60), None)
    }
}

impl RejoinStrategy for RejoinPolicy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max_attempts) if attempt > max_attempts => None,
            _ => Some(self.interval(attempt)),
        }
    }
}

/// Call `member.join()` until it returns `Ok`, a fatal error, or the
/// strategy gives up. Shutdown during a back-off returns `Ok`.
pub async fn run<M>(
    member: &M,
    strategy: &dyn RejoinStrategy,
    shutdown: &CancellationToken,
) -> Result<(), ListenerError>
where
    M: GroupMember + ?Sized,
{
    let mut attempt: u32 = 0;

    loop {
        let error = match member.join(shutdown).await {
            Ok(()) => return Ok(()),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        if shutdown.is_cancelled() {
            info!(error = ?error, "Not rejoining, shutdown requested");
            return Ok(());
        }

        attempt = attempt.saturating_add(1);
        metrics::counter!(REJOIN_ATTEMPTS).increment(1);

        let Some(delay) = strategy.next_delay(attempt) else {
            return Err(ListenerError::RejoinBudgetExhausted {
                attempts: attempt,
                source: Box::new(error),
            });
        };

        warn!(
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = ?error,
            "Rejoining consumer group after back-off"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
