//! Bounded exponential backoff.
//!
//! Used for transient I/O against shard files and for the redelivery delay
//! of jobs that fail retryably.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at the max delay.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u128 << shift;
        let scaled = self.base_delay.as_millis().saturating_mul(factor);
        let raw = Duration::from_millis(scaled.min(u128::from(u64::MAX)) as u64);
        match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. Exhaustion surfaces as [`Error::StorageUnavailable`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(Error::Io(source)) => {
                    if attempt >= self.max_attempts {
                        return Err(Error::StorageUnavailable {
                            operation,
                            attempts: attempt,
                            source,
                        });
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient io error: {source}"
                    );
                    metrics::storage_retries().add(1, &[KeyValue::new("operation", operation)]);
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(4, Duration::from_millis(25)).with_max_delay(Duration::from_secs(1))
    }
}
