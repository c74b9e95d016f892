//! Exponential backoff shared by the executor, the scheduler and message
//! handlers.
//!
//! The delay before attempt `n + 1` is:
//!
//! ```text
//! delay = min(base_delay * 2^(n-1), max_delay)
//! ```
//!
//! Retries stop early when the error is not retryable or when the supplied
//! [`CancellationToken`] fires, either before an attempt or while sleeping.

use crate::errors::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: usize,
    /// Delay after the first failure (doubles with each attempt).
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound on a single delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// Sleep for `delay`, returning [`PipelineError::Cancelled`] if the token
/// fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

/// Run `operation` until it succeeds, the policy is exhausted, the error is
/// permanent, or `cancel` fires.
///
/// `operation` receives the 1-based attempt number. The final error is
/// returned unchanged so callers can classify it.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let total_t0 = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !e.is_retryable() || attempt >= max_attempts {
                    error!(
                        label,
                        attempt,
                        max = max_attempts,
                        elapsed_ms_total = total_t0.elapsed().as_millis() as u64,
                        error = %e,
                        "giving up"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt,
                    max = max_attempts,
                    ?delay,
                    error = %e,
                    "attempt failed; backing off"
                );
                sleep_or_cancel(delay, cancel).await?;
            }
        }
    }
}

/// Serialise durations as integer milliseconds in config files.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
