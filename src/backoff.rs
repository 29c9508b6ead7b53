// Firmware Command Transport for Rust
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Two-phase wait policy.
//!
//! Waiters sleep briefly while a fast completion is still likely, then
//! escalate to longer sleeps. The policy is a pure function of elapsed time
//! so the curve can be tested without real timing.

use std::time::Duration;

/// Length of the short-sleep phase.
const DEFAULT_SHORT_PHASE: Duration = Duration::from_micros(200);

/// Sleep used during the short phase.
const DEFAULT_SHORT_DELAY: Duration = Duration::from_micros(10);

/// Sleep used once the short phase is over.
const DEFAULT_LONG_DELAY: Duration = Duration::from_micros(500);

/// Escalating sleep schedule for completion waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// How long to keep using `short_delay`.
    pub short_phase: Duration,
    /// Sleep while `elapsed < short_phase`.
    pub short_delay: Duration,
    /// Sleep afterwards.
    pub long_delay: Duration,
}

impl Backoff {
    pub const fn new(short_phase: Duration, short_delay: Duration, long_delay: Duration) -> Self {
        Self {
            short_phase,
            short_delay,
            long_delay,
        }
    }

    /// Sleep to use after `elapsed` time spent waiting.
    #[inline]
    pub fn next_sleep(&self, elapsed: Duration) -> Duration {
        if elapsed < self.short_phase {
            self.short_delay
        } else {
            self.long_delay
        }
    }

    /// Sleep bounded by the time left before `timeout`.
    ///
    /// Returns `None` once the timeout has passed.
    pub fn sleep_for(&self, elapsed: Duration, timeout: Duration) -> Option<Duration> {
        let remaining = timeout.checked_sub(elapsed).filter(|r| !r.is_zero())?;
        Some(self.next_sleep(elapsed).min(remaining))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_SHORT_PHASE, DEFAULT_SHORT_DELAY, DEFAULT_LONG_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_escalation() {
        let b = Backoff::new(10 * MS, MS, 5 * MS);
        assert_eq!(b.next_sleep(Duration::ZERO), MS);
        assert_eq!(b.next_sleep(9 * MS), MS);
        assert_eq!(b.next_sleep(10 * MS), 5 * MS);
        assert_eq!(b.next_sleep(Duration::from_secs(3)), 5 * MS);
    }

    #[test]
    fn test_bounded_by_timeout() {
        let b = Backoff::new(10 * MS, MS, 5 * MS);
        assert_eq!(b.sleep_for(Duration::ZERO, 100 * MS), Some(MS));
        assert_eq!(b.sleep_for(98 * MS, 100 * MS), Some(2 * MS));
        assert_eq!(b.sleep_for(100 * MS, 100 * MS), None);
        assert_eq!(b.sleep_for(150 * MS, 100 * MS), None);
    }

    #[test]
    fn test_sum_of_sleeps_reaches_timeout() {
        // Walking the schedule never overshoots the timeout
        let b = Backoff::default();
        let timeout = 20 * MS;
        let mut elapsed = Duration::ZERO;
        let mut steps = 0;
        while let Some(s) = b.sleep_for(elapsed, timeout) {
            elapsed += s;
            steps += 1;
        }
        assert_eq!(elapsed, timeout);
        assert!(steps > 20);
    }
}
