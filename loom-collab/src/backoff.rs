//! Reconnect delay policy.
//!
//! Delays come from a jitter-free [`backon`] exponential schedule: the first
//! wait is `base`, each failed attempt doubles it, and `max` caps it. A
//! successful connect rebuilds the schedule from scratch.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

fn build_schedule(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBuilder::new()
        .with_min_delay(base)
        .with_max_delay(max)
        .with_factor(2.0)
        .without_max_times()
        .build()
}

/// Exponential backoff: `min(base · 2^failures, max)`.
pub struct Backoff {
    base: Duration,
    max: Duration,
    schedule: ExponentialBackoff,
    next: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let mut schedule = build_schedule(base, max);
        let next = schedule.next().unwrap_or(max);
        Self {
            base,
            max,
            schedule,
            next,
            failures: 0,
        }
    }

    /// Delay before the next attempt.
    pub fn delay(&self) -> Duration {
        self.next
    }

    /// Count an attempt that failed before the link opened.
    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.next = self.schedule.next().unwrap_or(self.max);
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.schedule = build_schedule(self.base, self.max);
        self.next = self.schedule.next().unwrap_or(self.max);
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_are_non_decreasing_and_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(2500));
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = backoff.delay();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(2500));
            previous = delay;
            backoff.record_failure();
        }
        assert_eq!(backoff.delay(), Duration::from_millis(2500));
    }

    #[test]
    fn test_doubling_sequence() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10));
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(backoff.delay().as_millis());
            backoff.record_failure();
        }
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(2500));
        for _ in 0..4 {
            backoff.record_failure();
        }
        assert_eq!(backoff.failures(), 4);
        assert_eq!(backoff.delay(), Duration::from_millis(1600));
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.delay(), Duration::from_millis(100));
    }
}
