// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Injected random source for every probabilistic choice in a run
//! OWNERS: @mmgen
//! PUBLIC API: RandSource, SeededRng, DEFAULT_SEED
//! DEPENDS_ON: rand (StdRng)
//! INVARIANTS: Same seed + same call sequence => same values
//!
//! The allocator and the table builder never touch a global generator. They
//! take `&mut dyn RandSource`, so tests can substitute a scripted source and
//! full runs stay reproducible from `GenConfig::seed`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const DEFAULT_SEED: u64 = 0x6d6d67656e; // ASCII "mmgen"

/// Random source contract used by the allocator and the table builder.
pub trait RandSource {
    /// Uniform value in `lo..=hi`. Returns `lo` when `hi < lo`.
    fn random_in_range(&mut self, lo: u64, hi: u64) -> u64;

    /// Uniform value in `0..=99`.
    fn percent(&mut self) -> u32 {
        self.random_in_range(0, 99) as u32
    }

    /// True with `probability` percent chance.
    fn with_probability_of(&mut self, probability: u32) -> bool {
        self.percent() < probability
    }

    fn coin(&mut self) -> bool {
        self.with_probability_of(50)
    }
}

/// Fisher-Yates over `items` driven by `rng`.
pub fn shuffle<T>(rng: &mut dyn RandSource, items: &mut [T]) {
    for i in (1..items.len()).rev() {
        let j = rng.random_in_range(0, i as u64) as usize;
        items.swap(i, j);
    }
}

/// Default seeded source.
#[derive(Clone, Debug)]
pub struct SeededRng {
    seed: u64,
    inner: StdRng,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self { seed, inner: StdRng::seed_from_u64(seed) }
    }

    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl Default for SeededRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl RandSource for SeededRng {
    fn random_in_range(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo {
            return lo;
        }
        self.inner.gen_range(lo..=hi)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::RandSource;

    /// Replays a fixed script of values, clamped into the requested range.
    pub struct ScriptedRng {
        values: Vec<u64>,
        next: usize,
    }

    impl ScriptedRng {
        pub fn new(values: &[u64]) -> Self {
            Self { values: values.to_vec(), next: 0 }
        }

        /// Always answers the low end of the range: percent() == 0, so every
        /// probability roll above zero succeeds.
        pub fn low() -> Self {
            Self::new(&[0])
        }

        /// Always answers 99 for percent() so only certain rolls succeed.
        pub fn high() -> Self {
            Self::new(&[u64::MAX])
        }
    }

    impl RandSource for ScriptedRng {
        fn random_in_range(&mut self, lo: u64, hi: u64) -> u64 {
            let raw = self.values[self.next % self.values.len()];
            self.next += 1;
            if hi <= lo {
                lo
            } else {
                lo + raw.min(hi - lo)
            }
        }
    }
}
