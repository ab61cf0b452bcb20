use super::errors::ConnectionError;
use super::state_machine::{ConnectionStateMachine, MAX_RETRY_ATTEMPTS};
use super::types::ErrorCategory;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

/// Backoff schedule for retryable connection failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before attempt `attempt + 1`, or `None` when the error must not be retried
    pub fn delay_for(&self, error: &ConnectionError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() {
            return None;
        }

        let attempt = attempt.max(1);
        let base = self.config.base_delay_ms;
        let millis = match error.category() {
            // Exponential backoff
            ErrorCategory::Network => base.saturating_mul(1u64 << (attempt - 1).min(16)),
            // Linear backoff
            ErrorCategory::Timeout => base.saturating_mul(attempt as u64),
            _ => return None,
        }
        .min(self.config.max_delay_ms);

        let millis = if self.config.jitter && millis > 0 {
            let factor: f64 = rand::rng().random_range(0.8..=1.2);
            ((millis as f64) * factor) as u64
        } else {
            millis
        };

        Some(Duration::from_millis(millis))
    }

    /// Run `operation` until it succeeds or retrying is no longer allowed
    ///
    /// The operation is expected to record its own failures on `machine`
    /// (see [`ConnectionStateMachine::set_last_error`]); the loop stops when
    /// the error is not retryable, the attempt budget is spent, or the machine
    /// refuses further retries.
    pub async fn execute_with_retry<'a, T, F>(
        &self,
        machine: &ConnectionStateMachine,
        mut operation: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnMut(u32) -> BoxFuture<'a, Result<T, ConnectionError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error.with_attempt(attempt),
            };

            if attempt >= self.config.max_attempts || !machine.can_retry() {
                warn!("Giving up after {} attempt(s): {}", attempt, error);
                return Err(error);
            }

            match self.delay_for(&error, attempt) {
                Some(delay) => {
                    debug!(
                        "Attempt {} failed ({}), retrying in {}ms",
                        attempt,
                        error.code(),
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
