//! Backoff for transactions whose apply step failed.

use std::time::Duration;

/// Bounded exponential backoff with a retry budget.
///
/// Only failures against an up-to-date snapshot are charged against
/// `max_retries`; those cannot be explained by a stale read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            max_retries: 16,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_retries,
        }
    }

    /// Delay before the retry following the `attempt`-th failure (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Returns true once `failures` charged failures exceed the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_retries
    }
}
