//! Exponential backoff policy.
//!
//! The policy is pure data; the async executor that sleeps between
//! attempts lives in the app crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Attempts and delays for retrying a transient failure.
///
/// The delay before attempt `n` (1-based, `n >= 2`) is
/// `base_delay × 2^(n−2)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Run each operation exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Sleep before the given attempt (1-based). The first attempt never
    /// waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (attempt - 2).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_and_cap() {
        let p = RetryPolicy {
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(p.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let p = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.attempts(), 1);
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }
}
