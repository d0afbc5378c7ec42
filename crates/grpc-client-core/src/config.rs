//! Channel configuration and per-method retry/hedging policies.
//!
//! Policies are validated once, at channel build time, and fail closed: an
//! invalid configuration prevents the channel from being constructed rather
//! than degrading at call time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::status::StatusCode;
use crate::transport::CallCredentials;

/// Default cap on a single received message, 4 MiB.
pub const DEFAULT_MAX_RECEIVE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by eager policy validation.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// A method declared both a retry policy and a hedging policy.
    #[error("method {method} declares both a retry policy and a hedging policy")]
    BothPoliciesSet {
        /// The offending method.
        method: String,
    },

    /// `max_attempts` must allow at least one retry or hedge.
    #[error("max_attempts must be greater than 1, got {got}")]
    MaxAttemptsTooLow {
        /// The configured value.
        got: u32,
    },

    /// A backoff duration must be positive.
    #[error("{field} must be greater than zero")]
    NonPositiveBackoff {
        /// Which field was invalid.
        field: &'static str,
    },

    /// The backoff multiplier must be positive.
    #[error("backoff_multiplier must be greater than zero, got {got}")]
    NonPositiveMultiplier {
        /// The configured value.
        got: f64,
    },

    /// A retry policy must name at least one retryable status code.
    #[error("retryable_status_codes must not be empty")]
    EmptyRetryableStatusCodes,

    /// The hedging delay must not be negative.
    #[error("hedging_delay_ms must not be negative, got {got}")]
    NegativeHedgingDelay {
        /// The configured value.
        got: i64,
    },
}

/// Retry policy for a method.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum total attempts, including the first (> 1).
    pub max_attempts: u32,
    /// Initial backoff before the first retry, in milliseconds (> 0).
    pub initial_backoff_ms: u64,
    /// Upper bound on the backoff, in milliseconds (> 0).
    pub max_backoff_ms: u64,
    /// Multiplier applied to the backoff after each attempt (> 0).
    pub backoff_multiplier: f64,
    /// Status codes that permit a retry (non-empty).
    pub retryable_status_codes: Vec<StatusCode>,
}

impl RetryPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts <= 1 {
            return Err(ConfigError::MaxAttemptsTooLow {
                got: self.max_attempts,
            });
        }
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::NonPositiveBackoff {
                field: "initial_backoff_ms",
            });
        }
        if self.max_backoff_ms == 0 {
            return Err(ConfigError::NonPositiveBackoff {
                field: "max_backoff_ms",
            });
        }
        if self.backoff_multiplier <= 0.0 {
            return Err(ConfigError::NonPositiveMultiplier {
                got: self.backoff_multiplier,
            });
        }
        if self.retryable_status_codes.is_empty() {
            return Err(ConfigError::EmptyRetryableStatusCodes);
        }
        Ok(())
    }

    /// Returns `true` if `code` permits a retry.
    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_status_codes.contains(&code)
    }
}

/// Hedging policy for a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HedgingPolicy {
    /// Maximum concurrent attempts, including the first (> 1).
    pub max_attempts: u32,
    /// Delay before each additional hedge is launched, in milliseconds (>= 0).
    pub hedging_delay_ms: i64,
    /// Status codes that do not end the hedged call (other attempts keep
    /// running); any other non-OK status is fatal.
    pub non_fatal_status_codes: Vec<StatusCode>,
}

impl HedgingPolicy {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts <= 1 {
            return Err(ConfigError::MaxAttemptsTooLow {
                got: self.max_attempts,
            });
        }
        if self.hedging_delay_ms < 0 {
            return Err(ConfigError::NegativeHedgingDelay {
                got: self.hedging_delay_ms,
            });
        }
        Ok(())
    }

    /// Returns `true` if `code` is non-fatal for the hedged call.
    pub fn is_non_fatal(&self, code: StatusCode) -> bool {
        self.non_fatal_status_codes.contains(&code)
    }

    /// The hedging delay as a `Duration`. Valid only after validation.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.hedging_delay_ms.max(0) as u64)
    }
}

/// Raw per-method configuration as supplied by the application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    /// Optional retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Optional hedging policy. Mutually exclusive with `retry_policy`.
    pub hedging_policy: Option<HedgingPolicy>,
}

impl MethodConfig {
    /// Validates this configuration for `method` and returns the resolved
    /// dispatch policy.
    pub fn validate(&self, method: &str) -> Result<CallPolicy, ConfigError> {
        match (&self.retry_policy, &self.hedging_policy) {
            (Some(_), Some(_)) => Err(ConfigError::BothPoliciesSet {
                method: method.to_string(),
            }),
            (Some(retry), None) => {
                retry.validate()?;
                Ok(CallPolicy::Retry(retry.clone()))
            }
            (None, Some(hedging)) => {
                hedging.validate()?;
                Ok(CallPolicy::Hedging(hedging.clone()))
            }
            (None, None) => Ok(CallPolicy::Plain),
        }
    }
}

/// Validated dispatch policy for a method, selected once at channel build.
#[derive(Debug, Clone, PartialEq)]
pub enum CallPolicy {
    /// Exactly one attempt, no orchestration.
    Plain,
    /// Attempts are retried per the policy.
    Retry(RetryPolicy),
    /// Attempts are hedged per the policy.
    Hedging(HedgingPolicy),
}

/// How cancellation outcomes are reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancellationMode {
    /// Cancellation surfaces as a typed status error (`CallError::Rpc`).
    #[default]
    StatusError,
    /// Cancellation surfaces as a cooperative signal (`CallError::Cancelled`).
    CooperativeError,
}

/// Channel-wide configuration.
#[derive(Clone, Default)]
pub struct ChannelConfig {
    /// How cancellation and deadline outcomes are reported.
    pub cancellation_mode: CancellationMode,
    /// Cap on a single received message; 0 means the default.
    pub max_receive_message_size: usize,
    /// Per-method policies, keyed by `service/method`.
    pub method_configs: HashMap<String, MethodConfig>,
    /// Optional credentials applied to every call.
    pub credentials: Option<Arc<dyn CallCredentials>>,
}

impl ChannelConfig {
    /// Effective receive-size cap.
    pub fn receive_limit(&self) -> usize {
        if self.max_receive_message_size == 0 {
            DEFAULT_MAX_RECEIVE_MESSAGE_SIZE
        } else {
            self.max_receive_message_size
        }
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("cancellation_mode", &self.cancellation_mode)
            .field("max_receive_message_size", &self.max_receive_message_size)
            .field("method_configs", &self.method_configs.len())
            .field("has_credentials", &self.credentials.is_some())
            .finish()
    }
}
