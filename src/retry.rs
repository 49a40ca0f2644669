//! Bounded exponential backoff for transient storage faults.

use std::future::Future;
use std::time::Duration;

use crate::error::StorageError;
use crate::metrics::BrookMetrics;

/// Retry policy applied to every storage call.
///
/// Transient faults (timeouts, throttling, 5xx) are retried with a delay
/// of `min(base_delay * 2^(attempt-1), max_delay)`. A server-provided
/// retry-after hint replaces the computed delay, capped at `max_delay`.
/// Each attempt is bounded by `attempt_timeout`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use brook_es::RetryPolicy;
///
/// let policy = RetryPolicy {
///     max_attempts: 3,
///     ..RetryPolicy::default()
/// };
/// assert_eq!(policy.backoff(1, None), Duration::from_millis(100));
/// assert_eq!(policy.backoff(3, None), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay, including retry-after hints.
    pub max_delay: Duration,
    /// Upper bound for a single attempt; elapsing counts as a timeout.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned as-is after the first attempt.
    /// Exhausting the budget yields [`StorageError::Unavailable`].
    pub async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.run_observed(operation, None, f).await
    }

    /// Same as [`run`](Self::run), counting retries in
    /// `brook_storage_retries_total`.
    pub(crate) async fn run_observed<T, F, Fut>(
        &self,
        operation: &'static str,
        metrics: Option<&BrookMetrics>,
        mut f: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = match tokio::time::timeout(self.attempt_timeout, f()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(StorageError::Timeout),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if attempt >= max_attempts {
                tracing::warn!(operation, attempts = attempt, error = %err, "storage retries exhausted");
                return Err(StorageError::Unavailable {
                    operation,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff(attempt, err.retry_after());
            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient storage fault, retrying"
            );
            if let Some(metrics) = metrics {
                metrics.storage_retry(operation);
            }
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
