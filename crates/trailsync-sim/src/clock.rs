use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use trailsync_core::clock::{Clock, TimestampMs};

use crate::rng::DeterministicRng;

/// How per-client clocks are generated for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub base_millis: i64,
    /// Wall time that passes per simulation round.
    pub tick_millis: i64,
    /// Largest absolute drift assigned to a client, parts per million.
    pub max_abs_drift_ppm: i32,
    /// Largest absolute constant offset assigned to a client.
    pub max_abs_skew_millis: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            base_millis: 1_700_000_000_000,
            tick_millis: 1_000,
            max_abs_drift_ppm: 200,
            max_abs_skew_millis: 400,
        }
    }
}

impl ClockConfig {
    /// Draw a concrete spec for one client.
    #[must_use]
    pub fn assign(&self, rng: &mut DeterministicRng) -> ClockSpec {
        let drift_span = u64::from(self.max_abs_drift_ppm.unsigned_abs()) * 2 + 1;
        let drift = i64::try_from(rng.next_bounded(drift_span)).unwrap_or(0)
            - i64::from(self.max_abs_drift_ppm.unsigned_abs());
        let skew_span = self.max_abs_skew_millis.unsigned_abs() * 2 + 1;
        let skew = i64::try_from(rng.next_bounded(skew_span)).unwrap_or(0)
            - i64::try_from(self.max_abs_skew_millis.unsigned_abs()).unwrap_or(0);
        ClockSpec {
            base_millis: self.base_millis,
            tick_millis: self.tick_millis,
            drift_ppm: i32::try_from(drift).unwrap_or(0),
            skew_millis: skew,
        }
    }

    /// The reference clock, no skew and no drift. The server runs on it.
    #[must_use]
    pub const fn reference(&self) -> ClockSpec {
        ClockSpec {
            base_millis: self.base_millis,
            tick_millis: self.tick_millis,
            drift_ppm: 0,
            skew_millis: 0,
        }
    }
}

/// Concrete per-client clock parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockSpec {
    pub base_millis: i64,
    pub tick_millis: i64,
    pub drift_ppm: i32,
    pub skew_millis: i64,
}

impl ClockSpec {
    /// Wall time shown by this clock during `round`.
    #[must_use]
    pub fn now_at(&self, round: u64) -> TimestampMs {
        let round = i64::try_from(round).unwrap_or(i64::MAX);
        let progress = self.tick_millis.saturating_mul(round);
        let drift = progress
            .saturating_mul(i64::from(self.drift_ppm))
            .saturating_div(1_000_000);
        self.base_millis
            .saturating_add(self.skew_millis)
            .saturating_add(progress)
            .saturating_add(drift)
    }
}

/// Round counter shared by the simulator and every clock it hands out.
#[derive(Debug, Clone, Default)]
pub struct RoundCounter(Rc<Cell<u64>>);

impl RoundCounter {
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.get()
    }

    pub fn set(&self, round: u64) {
        self.0.set(round);
    }
}

/// A [`Clock`] that reads the shared round and applies its own skew and
/// drift.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    spec: ClockSpec,
    rounds: RoundCounter,
}

impl SimulatedClock {
    #[must_use]
    pub const fn new(spec: ClockSpec, rounds: RoundCounter) -> Self {
        Self { spec, rounds }
    }

    #[must_use]
    pub const fn spec(&self) -> ClockSpec {
        self.spec
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> TimestampMs {
        self.spec.now_at(self.rounds.get())
    }
}
