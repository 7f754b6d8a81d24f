//! Client-minted placeholder identifiers.
//!
//! A local id stands in for an entity until the server acknowledges its
//! create. The `local-` prefix keeps it disjoint from server ids, which never
//! carry it.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::clock::TimestampMs;

pub const LOCAL_ID_PREFIX: &str = "local-";

/// True if `id` was minted on a client and has not been swapped for a
/// server id.
#[must_use]
pub fn is_local_id(id: &str) -> bool {
    id.len() > LOCAL_ID_PREFIX.len() && id.starts_with(LOCAL_ID_PREFIX)
}

/// Mints `local-<millis base36>-<seq>-<random>` ids.
///
/// The sequence keeps ids from one minter unique even within a millisecond;
/// the random suffix separates minters restored from the same seed.
#[derive(Debug, Clone)]
pub struct LocalIdMinter {
    seq: u32,
    rng: StdRng,
}

impl LocalIdMinter {
    /// Minter seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seq: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reproducible minter for tests and simulation.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            seq: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn mint(&mut self, now_ms: TimestampMs) -> String {
        self.seq = self.seq.wrapping_add(1);
        let noise = self.rng.next_u32() & 0x00FF_FFFF;
        format!(
            "{LOCAL_ID_PREFIX}{}-{}-{noise:06x}",
            to_base36(now_ms.unsigned_abs()),
            self.seq
        )
    }
}

impl Default for LocalIdMinter {
    fn default() -> Self {
        Self::new()
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        let digit = u8::try_from(value % 36).unwrap_or_default();
        out.push(DIGITS[usize::from(digit)]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
