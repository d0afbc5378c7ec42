//! Hedged execution for unary calls.
//!
//! Launches staggered duplicate attempts and takes the first usable
//! outcome. A success or a fatal status settles the call and cancels the
//! remaining attempts; a status the policy marks non-fatal lets the other
//! attempts keep running and releases the next hedge immediately.

use std::future::Future;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::debug;

use crate::config::HedgingPolicy;
use crate::error::{CallError, Result};
use crate::metadata::Metadata;
use crate::status::{Status, StatusCode};

pub(crate) struct HedgeExecutor {
    policy: HedgingPolicy,
}

impl HedgeExecutor {
    pub(crate) fn new(policy: HedgingPolicy) -> Self {
        Self { policy }
    }

    /// Executes up to `max_attempts` copies of `operation`, passing each its
    /// 1-based ordinal. Losing attempts are aborted, which disposes their
    /// underlying calls.
    pub(crate) async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut tasks: JoinSet<Result<T>> = JoinSet::new();
        let mut launched = 1u32;
        tasks.spawn(operation(1));
        let mut next_at = Instant::now() + self.policy.delay();
        let mut last_err: Option<CallError> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_at), if launched < self.policy.max_attempts => {
                    launched += 1;
                    debug!(ordinal = launched, "launching hedged attempt");
                    tasks.spawn(operation(launched));
                    next_at = Instant::now() + self.policy.delay();
                }
                joined = tasks.join_next() => {
                    match joined {
                        None => {
                            // Every launched attempt failed non-fatally and
                            // the budget is spent.
                            return Err(last_err.unwrap_or_else(exhausted));
                        }
                        // An aborted sibling; nothing to record.
                        Some(Err(_)) => continue,
                        Some(Ok(Ok(value))) => {
                            tasks.abort_all();
                            return Ok(value);
                        }
                        Some(Ok(Err(err))) => {
                            let fatal = match err.status() {
                                Some(status) => !self.policy.is_non_fatal(status.code()),
                                None => true,
                            };
                            if fatal {
                                tasks.abort_all();
                                return Err(err);
                            }
                            debug!(error = %err, "hedged attempt failed non-fatally");
                            last_err = Some(err);
                            if tasks.is_empty() && launched >= self.policy.max_attempts {
                                return Err(last_err.unwrap_or_else(exhausted));
                            }
                            // A non-fatal failure releases the next hedge
                            // without waiting out the delay.
                            if launched < self.policy.max_attempts {
                                launched += 1;
                                tasks.spawn(operation(launched));
                                next_at = Instant::now() + self.policy.delay();
                            }
                        }
                    }
                }
            }
        }
    }
}

fn exhausted() -> CallError {
    CallError::Rpc {
        status: Status::new(StatusCode::Internal, "all hedged attempts failed"),
        trailers: Metadata::new(),
    }
}
