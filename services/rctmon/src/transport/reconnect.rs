//! Reconnection backoff
//!
//! Exponential backoff with jitter. The helper only tracks attempts and
//! computes delays; the caller owns the transport and performs the actual
//! connect between [`ReconnectHelper::wait_before_attempt`] and
//! [`ReconnectHelper::mark_connected`] / [`ReconnectHelper::record_failure`].
//! Attempts are never limited: an absent device is retried for as long as the
//! process runs.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reconnection error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    /// Reconnection was cancelled
    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Wait before the first retry
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    /// Whether to add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Create from configuration values
    pub fn from_config(
        initial_delay_ms: u64,
        max_delay_ms: u64,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Self {
        Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            backoff_multiplier,
            jitter,
        }
    }

    /// Un-jittered wait before the given retry (0 is the first retry)
    ///
    /// Computed in float seconds and clamped to `max_delay` before conversion,
    /// so any retry count and any multiplier yield a valid duration.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = retry.min(i32::MAX as u32) as i32;
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        if seconds.is_finite() && seconds >= 0.0 {
            Duration::from_secs_f64(seconds.min(max))
        } else {
            self.max_delay
        }
    }
}

/// Attempt counter with backoff
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    current_attempt: u32,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
        }
    }

    /// Mark the connection as successful; the next attempt starts without delay
    pub fn mark_connected(&mut self) {
        self.current_attempt = 0;
        debug!("Connection marked as successful");
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, reason: &str) {
        warn!("Attempt {} failed: {}", self.current_attempt, reason);
    }

    /// Calculate the next retry delay with exponential backoff
    pub fn calculate_next_delay(&self) -> Duration {
        // Attempt 2 is the first retry and waits exactly `initial_delay`
        let mut delay = self
            .policy
            .delay_for_retry(self.current_attempt.saturating_sub(2));

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    /// Count a new attempt and return how long to wait before making it
    ///
    /// The first attempt after construction or a success is immediate.
    pub fn begin_attempt(&mut self) -> Option<Duration> {
        self.current_attempt = self.current_attempt.saturating_add(1);

        if self.current_attempt > 1 {
            Some(self.calculate_next_delay())
        } else {
            None
        }
    }

    /// [`begin_attempt`](Self::begin_attempt) plus the wait, aborted by `cancel`
    pub async fn wait_before_attempt(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<(), ReconnectError> {
        if cancel.is_cancelled() {
            return Err(ReconnectError::Cancelled);
        }

        if let Some(delay) = self.begin_attempt() {
            info!(
                "Waiting {:?} before attempt {}",
                delay, self.current_attempt
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        }

        Ok(())
    }
}
