//! Retention window arithmetic.

use crate::clock::TimestampMs;

/// Floor for the per-trace point cap, whatever the window.
pub const MIN_TRACE_POINTS: usize = 2_000;

/// Slack above one-point-per-second so a 1 Hz source never hits the cap
/// before the time cutoff does.
pub const TRACE_POINT_HEADROOM: usize = 200;

/// Soft cap on samples per trace: `max(2000, ceil(retention_s) + 200)`.
#[must_use]
pub fn max_trace_points(retention_ms: u64) -> usize {
    let seconds = usize::try_from(retention_ms.div_ceil(1_000)).unwrap_or(usize::MAX);
    MIN_TRACE_POINTS.max(seconds.saturating_add(TRACE_POINT_HEADROOM))
}

/// Oldest timestamp still inside the window ending at `now`.
#[must_use]
pub fn cutoff(now: TimestampMs, retention_ms: u64) -> TimestampMs {
    now.saturating_sub(i64::try_from(retention_ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_windows_use_the_floor() {
        assert_eq!(max_trace_points(0), 2_000);
        assert_eq!(max_trace_points(60_000), 2_000);
        assert_eq!(max_trace_points(1_800_000), 2_000);
    }

    #[test]
    fn long_windows_scale_with_seconds() {
        assert_eq!(max_trace_points(3_600_000), 3_800);
        // Partial seconds round up.
        assert_eq!(max_trace_points(3_600_001), 3_801);
    }

    #[test]
    fn cutoff_saturates() {
        assert_eq!(cutoff(10_000, 4_000), 6_000);
        assert_eq!(cutoff(i64::MIN + 5, 100), i64::MIN);
        assert_eq!(cutoff(0, u64::MAX), -i64::MAX);
    }
}
