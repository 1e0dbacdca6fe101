//! Reconnection logic with exponential backoff
//!
//! Delay for attempt `n` is `min(base * 2^(n-1), cap)` plus uniform random
//! jitter in `[0, 0.3 * delay]`. The attempt counter resets on a successful
//! channel open, not on registration ack.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on the un-jittered delay
    pub cap: Duration,
    /// Jitter fraction added on top of the delay
    pub jitter: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(60_000),
            jitter: 0.3,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Drives the retry schedule for the single control channel.
///
/// The run loop owns the controller exclusively, so only one reconnection
/// sequence can ever be active; there is no reentrant path to guard.
pub struct ReconnectController {
    config: ReconnectConfig,
    attempt: usize,
    cancel: CancellationToken,
}

impl ReconnectController {
    pub fn new(config: ReconnectConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            attempt: 0,
            cancel,
        }
    }

    /// Un-jittered delay for a 1-indexed attempt number
    pub fn base_delay(config: &ReconnectConfig, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as u32;
        let doubled = config
            .base
            .saturating_mul(2u32.saturating_pow(exponent));
        doubled.min(config.cap)
    }

    /// Wait before the next attempt.
    ///
    /// Cancellation aborts the pending timer immediately.
    pub async fn wait(&mut self) -> Result<(), ReconnectError> {
        if self.cancel.is_cancelled() {
            return Err(ReconnectError::Cancelled);
        }

        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        let base = Self::base_delay(&self.config, self.attempt);
        let jitter = if self.config.jitter > 0.0 {
            base.mul_f64(rand::thread_rng().gen_range(0.0..self.config.jitter))
        } else {
            Duration::ZERO
        };
        let delay = base + jitter;

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            delay, self.attempt
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Reset the attempt counter (call after a successful channel open)
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
