//! Exponential backoff with jitter, shared by the storage backends and the
//! coordination client.

use crate::config::RetryConfig;
use crate::utils::errors::{BackupError, Result};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before attempt `attempt` (1-based retry counter), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let base_ms = base.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        // Up to 50% jitter so concurrent nodes do not retry in lockstep.
        let jitter = fastrand::u64(0..=base_ms / 2);
        Duration::from_millis((base_ms + jitter).min(self.max_delay.as_millis() as u64))
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Transient failures that exhaust the attempts become
    /// [`BackupError::StorageUnavailable`], or a permanent coordination error
    /// when the coordination layer was the one failing.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f().await {
                Ok(val) => return Ok(val),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{op_name}: transient error (attempt {}/{}), retrying in {:?}: {e}",
                        attempt,
                        self.max_attempts,
                        delay,
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e @ BackupError::Coordination { transient: true, .. }) => {
                    return Err(BackupError::coordination(format!(
                        "{op_name} failed after {attempt} attempts: {e}"
                    )));
                }
                Err(e) if e.is_transient() => {
                    return Err(BackupError::StorageUnavailable {
                        op: op_name.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
