//! Retry execution for unary calls.
//!
//! Drives repeated call attempts under a validated retry policy. Only
//! statuses named by the policy are retried; everything else, including
//! local failures with no status, surfaces immediately. The final attempt's
//! outcome is what the caller sees.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::Result;

/// Runs attempts until one succeeds, a non-retryable failure occurs, or the
/// attempt budget is exhausted.
#[derive(Debug, Clone)]
pub(crate) struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Executes `operation` per attempt, passing the 1-based ordinal.
    pub(crate) async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut ordinal = 1u32;
        loop {
            match operation(ordinal).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = match err.status() {
                        Some(status) => self.policy.is_retryable(status.code()),
                        None => false,
                    };
                    if !retryable || ordinal >= self.policy.max_attempts {
                        return Err(err);
                    }
                    let backoff = self.compute_backoff(ordinal - 1);
                    debug!(
                        ordinal,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying call attempt"
                    );
                    tokio::time::sleep(backoff).await;
                    ordinal += 1;
                }
            }
        }
    }

    /// Computes `initial * multiplier^attempt`, capped at the policy maximum,
    /// with jitter of up to half the computed delay.
    fn compute_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.policy.initial_backoff_ms as f64;
        let computed = base_ms * self.policy.backoff_multiplier.powi(attempt as i32);
        let capped = computed.min(self.policy.max_backoff_ms as f64) as u64;
        Duration::from_millis(capped.saturating_add(simple_jitter(capped / 2)))
    }
}

/// Cheap jitter from system time entropy.
fn simple_jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = Instant::now().elapsed().subsec_nanos() as u64;
    let ts_nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    (nanos ^ ts_nanos) % max_ms
}
