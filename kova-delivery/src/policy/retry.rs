//! Retry policy for individual sends.
//!
//! The executor is the only place that retries; this type just answers
//! "how many attempts" and "how long to wait before the next one".

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry configuration for one send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    ///
    /// Default: 2
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (milliseconds).
    ///
    /// The delay after attempt `n` (1-based) is `base * 2^(n - 1)`.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay (milliseconds).
    ///
    /// Default: 30000 ms
    #[serde(default = "defaults::max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::max_retries(),
            base_delay_ms: defaults::base_delay_ms(),
            max_delay_ms: defaults::max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Check if `attempt` (1-based) is the last one allowed.
    #[must_use]
    pub const fn is_final_attempt(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts()
    }

    /// Backoff to sleep after a failed `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

mod defaults {
    pub const fn max_retries() -> u32 {
        2
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }

    pub const fn max_delay_ms() -> u64 {
        30_000
    }
}
