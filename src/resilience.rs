//! Timeout and retry wrapper for network calls.
//!
//! Only [`BackupError::TransientIo`] is retried; configuration and local
//! filesystem failures are structural and surface immediately.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::{BackupError, Result};

/// Retry configuration for object storage calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// Delay before the retry
    pub retry_delay: Duration,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
    /// Add up to 10% jitter to the delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Default policy with a custom per-attempt timeout
    pub fn with_timeout(attempt_timeout: Duration) -> Self {
        Self {
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// A timed-out attempt counts as a transient failure.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = match tokio::time::timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(BackupError::TransientIo(format!(
                    "{} timed out after {:?}",
                    operation_name, self.attempt_timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay();
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %error,
                        "Transient failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn delay(&self) -> Duration {
        if self.jitter {
            let jitter_ms = (self.retry_delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
            self.retry_delay + Duration::from_millis(jitter_ms)
        } else {
            self.retry_delay
        }
    }
}
