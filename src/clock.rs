//! Monotonic time source and the dead-node backoff formula.
//!
//! Every timestamp the pool and pipeline reason about — `deadUntil`, audit
//! entry start/end, the retry-timeout budget — flows through a `Clock`. The
//! production implementation wraps `Instant::now`; tests inject a
//! `TestClock` that can be advanced by hand so backoff- and sniff-lifespan-
//! dependent assertions never need a real sleep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default minimum dead-time applied to a freshly failed node.
pub const DEFAULT_DEAD_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound the backoff formula never exceeds.
pub const DEFAULT_MAX_DEAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A monotonic time source, injectable so the pipeline's retry-timeout and
/// the pool's backoff math can be tested without real sleeps.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Computes the instant a node should be considered alive again after
    /// `attempts` consecutive failures.
    ///
    /// `now + clamp(min_timeout * 2 * 2^((attempts * 0.5) - 1), min_timeout, max_timeout)`.
    fn dead_time(
        &self,
        attempts: u32,
        min_timeout: Option<Duration>,
        max_timeout: Option<Duration>,
    ) -> Instant {
        let min_timeout = min_timeout.unwrap_or(DEFAULT_DEAD_TIMEOUT);
        let max_timeout = max_timeout.unwrap_or(DEFAULT_MAX_DEAD_TIMEOUT);
        let exponent = (attempts as f64 * 0.5) - 1.0;
        let scaled = min_timeout.as_secs_f64() * 2.0 * 2f64.powf(exponent);
        let clamped = scaled.clamp(min_timeout.as_secs_f64(), max_timeout.as_secs_f64());
        self.now() + Duration::from_secs_f64(clamped)
    }
}

/// Production clock backed by `Instant::now`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose `now()` can be advanced by hand, for deterministic tests of
/// sniff-lifespan and dead-node-resurrection behavior.
///
/// Stores an offset in milliseconds from the `Instant` captured at
/// construction, since `Instant` itself cannot be constructed from an
/// arbitrary value.
pub struct TestClock {
    epoch: Instant,
    offset_millis: AtomicU64,
}

impl TestClock {
    /// Creates a test clock anchored at the real current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_millis: AtomicU64::new(0),
        }
    }

    /// Advances the clock by `duration`. Subsequent calls to `now()` reflect
    /// the advance immediately.
    pub fn advance(&self, duration: Duration) {
        self.offset_millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.epoch + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_backoff_matches_formula() {
        let clock = SystemClock;
        let before = clock.now();
        let dead_until = clock.dead_time(1, None, None);
        // attempts=1 -> exponent=-0.5 -> 60 * 2 * 2^-0.5 ~= 84.85s.
        let elapsed = dead_until.duration_since(before).as_secs_f64();
        assert!((elapsed - 84.85).abs() < 0.5, "expected ~84.85s, got {elapsed}");
    }

    #[test]
    fn backoff_is_clamped_at_max() {
        let clock = SystemClock;
        let before = clock.now();
        let dead_until = clock.dead_time(100, None, None);
        let elapsed = dead_until.duration_since(before);
        assert_eq!(elapsed.as_secs(), DEFAULT_MAX_DEAD_TIMEOUT.as_secs());
    }

    #[test]
    fn four_times_dead_is_four_minutes() {
        let clock = SystemClock;
        let before = clock.now();
        // attempts=4 -> exponent=1 -> 60 * 2 * 2^1 = 240s exactly.
        let dead_until = clock.dead_time(4, None, None);
        let elapsed = dead_until.duration_since(before).as_secs_f64();
        assert!((elapsed - 240.0).abs() < 1.0, "expected ~240s, got {elapsed}");
    }

    #[test]
    fn test_clock_advances_deterministically() {
        let clock = TestClock::new();
        let t0 = clock.now();
        clock.advance(Duration::from_secs(10));
        let t1 = clock.now();
        assert_eq!(t1.duration_since(t0), Duration::from_secs(10));
    }
}
