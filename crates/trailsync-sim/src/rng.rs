use serde::{Deserialize, Serialize};

/// Small seeded generator for every random decision in a simulation run.
///
/// Plain LCG so a seed replays identically on every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: seed ^ 0x9E37_79B9_7F4A_7C15,
        }
    }

    /// Independent stream for a sub-component, derived from this seed.
    #[must_use]
    pub const fn fork(&self, salt: u64) -> Self {
        Self::new(self.state.rotate_left(17) ^ salt.wrapping_mul(0xA24B_AED4_963E_E407))
    }

    pub const fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.state
    }

    /// Next value in `[0, upper_exclusive)`; 0 when the bound is 0.
    pub const fn next_bounded(&mut self, upper_exclusive: u64) -> u64 {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u64() >> 11) % upper_exclusive
    }

    /// Bernoulli trial with an integer percentage.
    pub fn hit_rate_percent(&mut self, percent: u8) -> bool {
        match percent {
            0 => false,
            100.. => true,
            p => self.next_bounded(100) < u64::from(p),
        }
    }

    /// Uniform index into a slice of `len` items, `None` when empty.
    pub fn pick_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let bound = u64::try_from(len).unwrap_or(u64::MAX);
        usize::try_from(self.next_bounded(bound)).ok()
    }

    /// Uniform offset in `[-magnitude, magnitude]` with micro-unit resolution.
    pub fn jitter(&mut self, magnitude: f64) -> f64 {
        let micros = u32::try_from(self.next_bounded(2_000_001)).unwrap_or(1_000_000);
        (f64::from(micros) / 1_000_000.0 - 1.0) * magnitude
    }
}
