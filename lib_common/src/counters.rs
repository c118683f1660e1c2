//! # Rate counters (C14)
//!
//! An overflow-resistant `{ count, since }` pair used throughout both
//! the io core and the recorder core for unsynchronised, per-thread
//! rate telemetry (SPEC_FULL.md §3, §8). Grounded on
//! `core/memory_guard.rs`'s plain-`u64`-counter style, generalized to a
//! time-windowed rate with explicit overflow handling.

use std::time::Instant;

/// `count` increments per call; `since` marks when the window started.
/// Not `Sync` by design — SPEC_FULL.md §5 specifies counters as
/// "unsynchronised and therefore only accurate when read on the thread
/// that owns them."
#[derive(Debug, Clone, Copy)]
pub struct RateCounter {
    count: u32,
    since: Instant,
}

impl RateCounter {
    /// Starts a new window at `now`.
    pub fn new(now: Instant) -> RateCounter {
        RateCounter { count: 0, since: now }
    }

    /// Adds `k` to the running count. If `count + k` would overflow a
    /// `u32`, the counter resets to zero and the window restarts at
    /// `now` instead of wrapping.
    pub fn increment(&mut self, k: u32, now: Instant) {
        match self.count.checked_add(k) {
            Some(sum) => self.count = sum,
            None => {
                self.count = 0;
                self.since = now;
            }
        }
    }

    /// The current count in this window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Average increments per second since the window started, as of
    /// `now`. `0.0` if no time has elapsed yet.
    pub fn average_per_sec(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.since).as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.count as f64 / elapsed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn increment_accumulates_within_a_window() {
        let t0 = Instant::now();
        let mut counter = RateCounter::new(t0);
        counter.increment(5, t0);
        counter.increment(3, t0);
        assert_eq!(counter.count(), 8);
    }

    #[test]
    fn overflow_resets_count_and_restarts_the_window() {
        let t0 = Instant::now();
        let mut counter = RateCounter::new(t0);
        counter.increment(u32::MAX, t0);
        let t1 = t0 + Duration::from_secs(1);
        counter.increment(10, t1);
        assert_eq!(counter.count(), 0);
    }

    #[test]
    fn average_per_sec_matches_a_known_rate() {
        let t0 = Instant::now();
        let mut counter = RateCounter::new(t0);
        counter.increment(100, t0);
        let t1 = t0 + Duration::from_secs(2);
        let rate = counter.average_per_sec(t1);
        assert!((rate - 50.0).abs() < 5.0, "rate was {rate}");
    }
}
