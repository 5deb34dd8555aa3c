// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pluggable predicates over linear address candidates.

use std::collections::BTreeMap;

use crate::config::AddrFilterConfig;

/// Extracts bits `[hi:lo]` of `value`.
#[inline]
pub(crate) fn bits(value: u64, hi: u32, lo: u32) -> u64 {
    let width = hi - lo + 1;
    if width >= 64 {
        value >> lo
    } else {
        (value >> lo) & ((1u64 << width) - 1)
    }
}

#[inline]
fn bit(value: u64, n: u32) -> u64 {
    (value >> n) & 1
}

/// Candidate predicate. `accept` is asked for every candidate start address,
/// `record` once for the address finally handed out.
pub trait CandidateFilter {
    fn accept(&self, addr: u64) -> bool;
    fn record(&mut self, _addr: u64) {}
}

/// Caps how many addresses may share one index window, e.g. a cache set.
#[derive(Clone, Debug)]
pub struct IndexWindowLimit {
    lo: u32,
    hi: u32,
    max: u32,
    counts: BTreeMap<u64, u32>,
}

impl IndexWindowLimit {
    pub fn new(lo: u32, hi: u32, max: u32) -> Self {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        Self { lo, hi: hi.min(63), max, counts: BTreeMap::new() }
    }

    fn index(&self, addr: u64) -> u64 {
        bits(addr, self.hi, self.lo)
    }

    pub fn count(&self, addr: u64) -> u32 {
        self.counts.get(&self.index(addr)).copied().unwrap_or(0)
    }
}

impl CandidateFilter for IndexWindowLimit {
    fn accept(&self, addr: u64) -> bool {
        self.count(addr) < self.max
    }

    fn record(&mut self, addr: u64) {
        *self.counts.entry(self.index(addr)).or_insert(0) += 1;
    }
}

/// Rejects addresses whose way-predictor hash is zero, which would multi-hit.
#[derive(Clone, Copy, Debug, Default)]
pub struct WayPredictorHash;

impl WayPredictorHash {
    pub fn hash(va: u64) -> u64 {
        let folded = (bits(va, 18, 16) << 8)
            | (bit(va, 56) << 7)
            | (bit(va, 19) << 6)
            | (bit(va, 54) << 5)
            | (bit(va, 21) << 4)
            | bits(va, 52, 49);
        bits(va, 26, 16) ^ bits(va, 37, 27) ^ bits(va, 48, 38) ^ folded
    }
}

impl CandidateFilter for WayPredictorHash {
    fn accept(&self, addr: u64) -> bool {
        Self::hash(addr) != 0
    }
}

pub(crate) fn from_config(cfg: AddrFilterConfig) -> Box<dyn CandidateFilter> {
    match cfg {
        AddrFilterConfig::IndexWindow { lo, hi, max } => Box::new(IndexWindowLimit::new(lo, hi, max)),
        AddrFilterConfig::WayPredictor => Box::new(WayPredictorHash),
    }
}
