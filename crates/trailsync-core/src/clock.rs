//! Wall-clock source for retention and queue timestamps.
//!
//! Every time-dependent operation reads `now` through a [`Clock`] at the
//! moment it runs. Nothing captures a timestamp for later reuse, so purge
//! ticks stay correct when the host throttles timers.

use std::cell::Cell;
use std::rc::Rc;

/// Milliseconds since the Unix epoch.
pub type TimestampMs = i64;

/// Source of the current wall-clock time.
pub trait Clock {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> TimestampMs;
}

/// The host's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests and simulation.
///
/// Clones share the same instant, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<TimestampMs>>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    #[must_use]
    pub fn new(start_ms: TimestampMs) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    /// Jump to an absolute instant. Going backwards is allowed.
    pub fn set(&self, now_ms: TimestampMs) {
        self.now.set(now_ms);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now.set(self.now.get().saturating_add(delta_ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> TimestampMs {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_handles_share_time() {
        let clock = ManualClock::new(1_000);
        let engine_side = clock.clone();
        clock.advance(500);
        assert_eq!(engine_side.now_ms(), 1_500);
        engine_side.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
