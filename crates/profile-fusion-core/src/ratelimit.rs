//! Explicit rate budgets for metered external services.
//!
//! A [`RateBudget`] tracks requests and tokens in fixed windows (one
//! minute, one day) measured on an injectable [`Clock`]. Windows are
//! aligned to the clock's epoch, counters only grow within a window and
//! reset when the clock crosses a boundary.
//!
//! [`RateLimiter`] wraps a budget in a mutex so the check-then-increment
//! happens in one critical section, no matter how many tasks share it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{FusionError, RateWindow, Result};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(86_400);

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock time measured from construction.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// A clock that only moves when told to. Used in tests.
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.lock().map(|n| *n).unwrap_or_default()
    }
}

/// Ceilings per window. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: Option<u32>,
    pub tokens_per_minute: Option<u64>,
    pub requests_per_day: Option<u32>,
}

/// Current usage, for logging and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RateUsage {
    pub requests_this_minute: u32,
    pub tokens_this_minute: u64,
    pub requests_today: u32,
}

/// Counters for the current minute and day windows.
#[derive(Debug, Clone)]
pub struct RateBudget {
    limits: RateLimits,
    minute_window: u64,
    day_window: u64,
    usage: RateUsage,
}

impl RateBudget {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            minute_window: 0,
            day_window: 0,
            usage: RateUsage::default(),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    pub fn usage(&self, now: Duration) -> RateUsage {
        let mut copy = self.clone();
        copy.roll(now);
        copy.usage
    }

    fn roll(&mut self, now: Duration) {
        let minute = now.as_secs() / MINUTE.as_secs();
        if minute != self.minute_window {
            self.minute_window = minute;
            self.usage.requests_this_minute = 0;
            self.usage.tokens_this_minute = 0;
        }
        let day = now.as_secs() / DAY.as_secs();
        if day != self.day_window {
            self.day_window = day;
            self.usage.requests_today = 0;
        }
    }

    fn until_boundary(now: Duration, window: Duration) -> Duration {
        let w = window.as_millis() as u64;
        let n = now.as_millis() as u64;
        Duration::from_millis(w - n % w)
    }

    /// Reserve one request and `tokens` estimated tokens at time `now`.
    ///
    /// Nothing is charged when any ceiling would be exceeded.
    pub fn try_acquire(&mut self, now: Duration, tokens: u64) -> Result<()> {
        self.roll(now);

        if let Some(rpd) = self.limits.requests_per_day {
            if self.usage.requests_today >= rpd {
                return Err(FusionError::RateBudgetExhausted {
                    window: RateWindow::RequestsPerDay,
                    retry_after: Self::until_boundary(now, DAY),
                });
            }
        }
        if let Some(rpm) = self.limits.requests_per_minute {
            if self.usage.requests_this_minute >= rpm {
                return Err(FusionError::RateBudgetExhausted {
                    window: RateWindow::RequestsPerMinute,
                    retry_after: Self::until_boundary(now, MINUTE),
                });
            }
        }
        if let Some(tpm) = self.limits.tokens_per_minute {
            if self.usage.tokens_this_minute.saturating_add(tokens) > tpm {
                return Err(FusionError::RateBudgetExhausted {
                    window: RateWindow::TokensPerMinute,
                    retry_after: Self::until_boundary(now, MINUTE),
                });
            }
        }

        self.usage.requests_this_minute = self.usage.requests_this_minute.saturating_add(1);
        self.usage.requests_today = self.usage.requests_today.saturating_add(1);
        self.usage.tokens_this_minute = self.usage.tokens_this_minute.saturating_add(tokens);
        Ok(())
    }

    /// Replace an estimated token charge with the amount actually used.
    ///
    /// Only applies while the minute window the estimate was charged in is
    /// still current.
    pub fn settle(&mut self, now: Duration, minute_window: u64, estimated: u64, actual: u64) {
        self.roll(now);
        if minute_window != self.minute_window {
            return;
        }
        self.usage.tokens_this_minute = self
            .usage
            .tokens_this_minute
            .saturating_sub(estimated)
            .saturating_add(actual);
    }

    fn minute_window(&self) -> u64 {
        self.minute_window
    }
}

/// A granted reservation. Pass it back to [`RateLimiter::settle`] once the
/// real token usage is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    minute_window: u64,
    estimated_tokens: u64,
}

/// Thread-safe gate in front of a [`RateBudget`].
pub struct RateLimiter {
    budget: Mutex<RateBudget>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            budget: Mutex::new(RateBudget::new(limits)),
            clock,
        }
    }

    pub fn with_system_clock(limits: RateLimits) -> Self {
        Self::new(limits, Arc::new(SystemClock::new()))
    }

    fn poisoned() -> FusionError {
        FusionError::external("rate limiter", "lock poisoned", false)
    }

    /// Reserve one request with an estimated token cost.
    pub fn try_acquire(&self, estimated_tokens: u64) -> Result<Permit> {
        let now = self.clock.now();
        let mut budget = self.budget.lock().map_err(|_| Self::poisoned())?;
        budget.try_acquire(now, estimated_tokens)?;
        Ok(Permit {
            minute_window: budget.minute_window(),
            estimated_tokens,
        })
    }

    pub fn settle(&self, permit: Permit, actual_tokens: u64) {
        let now = self.clock.now();
        if let Ok(mut budget) = self.budget.lock() {
            budget.settle(
                now,
                permit.minute_window,
                permit.estimated_tokens,
                actual_tokens,
            );
        }
    }

    pub fn usage(&self) -> RateUsage {
        let now = self.clock.now();
        self.budget
            .lock()
            .map(|b| b.usage(now))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limits: RateLimits) -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new(limits, clock.clone());
        (clock, limiter)
    }

    #[test]
    fn test_requests_per_minute_excess_is_rejected() {
        let (_clock, limiter) = limiter(RateLimits {
            requests_per_minute: Some(10),
            ..Default::default()
        });
        for _ in 0..10 {
            limiter.try_acquire(0).unwrap();
        }
        let err = limiter.try_acquire(0).unwrap_err();
        assert!(matches!(
            err,
            FusionError::RateBudgetExhausted {
                window: RateWindow::RequestsPerMinute,
                ..
            }
        ));
        assert_eq!(limiter.usage().requests_this_minute, 10);
    }

    #[test]
    fn test_minute_window_rolls_over() {
        let (clock, limiter) = limiter(RateLimits {
            requests_per_minute: Some(2),
            ..Default::default()
        });
        clock.advance(Duration::from_secs(50));
        limiter.try_acquire(0).unwrap();
        limiter.try_acquire(0).unwrap();
        match limiter.try_acquire(0) {
            Err(FusionError::RateBudgetExhausted { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(10));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        clock.advance(Duration::from_secs(10));
        limiter.try_acquire(0).unwrap();
    }

    #[test]
    fn test_daily_budget_survives_minute_rollover() {
        let (clock, limiter) = limiter(RateLimits {
            requests_per_minute: Some(10),
            requests_per_day: Some(3),
            ..Default::default()
        });
        for _ in 0..3 {
            limiter.try_acquire(0).unwrap();
            clock.advance(Duration::from_secs(61));
        }
        assert!(matches!(
            limiter.try_acquire(0),
            Err(FusionError::RateBudgetExhausted {
                window: RateWindow::RequestsPerDay,
                ..
            })
        ));
        clock.advance(DAY);
        limiter.try_acquire(0).unwrap();
    }

    #[test]
    fn test_token_budget_and_settle() {
        let (_clock, limiter) = limiter(RateLimits {
            tokens_per_minute: Some(1_000),
            ..Default::default()
        });
        let permit = limiter.try_acquire(800).unwrap();
        assert!(limiter.try_acquire(300).is_err());
        // Fewer tokens were used than estimated; the remainder is released.
        limiter.settle(permit, 500);
        assert_eq!(limiter.usage().tokens_this_minute, 500);
        limiter.try_acquire(300).unwrap();
    }

    #[test]
    fn test_rejected_request_charges_nothing() {
        let (_clock, limiter) = limiter(RateLimits {
            requests_per_minute: Some(5),
            tokens_per_minute: Some(100),
            requests_per_day: Some(100),
        });
        assert!(limiter.try_acquire(500).is_err());
        let usage = limiter.usage();
        assert_eq!(usage.requests_this_minute, 0);
        assert_eq!(usage.requests_today, 0);
        assert_eq!(usage.tokens_this_minute, 0);
    }

    #[test]
    fn test_settle_never_goes_negative() {
        let mut budget = RateBudget::new(RateLimits::default());
        budget.try_acquire(Duration::ZERO, 10).unwrap();
        budget.settle(Duration::ZERO, 0, 50, 0);
        assert_eq!(budget.usage(Duration::ZERO).tokens_this_minute, 0);
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        let limiter = Arc::new(RateLimiter::new(
            RateLimits {
                requests_per_minute: Some(25),
                ..Default::default()
            },
            Arc::new(ManualClock::new()),
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..10).filter(|_| limiter.try_acquire(0).is_ok()).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 25);
    }
}
