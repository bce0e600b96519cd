//! Bounded exponential backoff for infrastructure setup
//!
//! Used when opening the kernel notification socket fails; see
//! [`crate::tunnel::interface_monitor`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retrying a failing setup step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,

    /// Base interval in milliseconds for exponential backoff
    pub base_interval_ms: u64,

    /// Multiplier for exponential backoff (typically 2)
    pub backoff_multiplier: u32,

    /// Maximum interval in milliseconds (cap for exponential growth)
    pub max_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_interval_ms: 1000,
            backoff_multiplier: 2,
            max_interval_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Validate the entire policy
    ///
    /// # Returns
    ///
    /// * `Ok(())` if all fields are valid
    /// * `Err(PolicyValidationError)` with the first validation error encountered
    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.max_attempts < 1 || self.max_attempts > 20 {
            return Err(PolicyValidationError::InvalidMaxAttempts(self.max_attempts));
        }
        if self.base_interval_ms < 1 || self.base_interval_ms > 300_000 {
            return Err(PolicyValidationError::InvalidBaseInterval(
                self.base_interval_ms,
            ));
        }
        if self.backoff_multiplier < 1 || self.backoff_multiplier > 10 {
            return Err(PolicyValidationError::InvalidBackoffMultiplier(
                self.backoff_multiplier,
            ));
        }
        if self.max_interval_ms < self.base_interval_ms {
            return Err(PolicyValidationError::MaxIntervalLessThanBase(
                self.max_interval_ms,
                self.base_interval_ms,
            ));
        }
        Ok(())
    }

    /// Calculate backoff duration before the attempt following `attempt`
    ///
    /// Formula: base_interval × multiplier^(attempt-1), capped at max_interval
    ///
    /// # Arguments
    ///
    /// * `attempt` - Attempt that just failed (1-indexed)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.backoff_multiplier as u64).saturating_pow(exponent);
        let interval_ms = self.base_interval_ms.saturating_mul(factor);

        Duration::from_millis(interval_ms.min(self.max_interval_ms))
    }
}

/// Errors from [`RetryPolicy::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyValidationError {
    #[error("max_attempts must be between 1 and 20, got: {0}")]
    InvalidMaxAttempts(u32),

    #[error("base_interval_ms must be between 1 and 300000, got: {0}")]
    InvalidBaseInterval(u64),

    #[error("backoff_multiplier must be between 1 and 10, got: {0}")]
    InvalidBackoffMultiplier(u32),

    #[error("max_interval_ms ({0}) must be >= base_interval_ms ({1})")]
    MaxIntervalLessThanBase(u64, u64),
}
