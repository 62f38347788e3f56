//! Explicit, splittable random keys.
//!
//! There is no process-wide generator: a [`PrngKey`] is a plain value that is
//! split deterministically into independent child keys and handed to whoever
//! needs randomness. The pipeline splits one key into `(M + N - 1) * N` keys up
//! front, one per (timestep, stage) pair, so no stage can observe another's
//! stream and results never depend on execution order.

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// SplitMix64 finaliser.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrngKey(u64);

impl PrngKey {
    pub fn new(seed: u64) -> Self {
        Self(mix(seed.wrapping_add(GOLDEN_GAMMA)))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Derives a child key from `data` without consuming `self`.
    pub fn fold_in(self, data: u64) -> Self {
        Self(mix(self.0 ^ mix(data.wrapping_add(1).wrapping_mul(GOLDEN_GAMMA))))
    }

    /// Splits into `count` independent keys, in a fixed order.
    pub fn split(self, count: usize) -> Vec<PrngKey> {
        (0..count as u64).map(|i| self.fold_in(i)).collect()
    }

    /// Splits into `rows * cols` keys arranged row-major.
    pub fn split_grid(self, rows: usize, cols: usize) -> Vec<Vec<PrngKey>> {
        let keys = self.split(rows * cols);
        keys.chunks(cols.max(1)).map(<[PrngKey]>::to_vec).collect()
    }

    /// A seeded generator for drawing values from this key's stream.
    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}
