// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One power-of-two slice `[2^id, 2^(id+1) - 1]` of an address space.
//!
//! Grouping by magnitude spreads generated addresses across the whole space
//! instead of piling them into the largest segment.

use log::{debug, warn};

use super::filter::CandidateFilter;
use super::range::RangeSet;
use crate::determinism::{shuffle, RandSource};
use crate::types::{AddressConstraint, Qualifiers, QUALIFIER_COUNT};

const ANYWHERE_PERCENT: u32 = 90;
const TRIES_PER_RANGE: usize = 10;

#[derive(Clone, Debug)]
pub struct Cluster {
    pub(crate) id: u32,
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) available: u64,
    pub(crate) qualifier_size: [u64; QUALIFIER_COUNT],
    pub(crate) segments: [RangeSet; QUALIFIER_COUNT],
    pub(crate) allocated: RangeSet,
}

impl Cluster {
    pub fn new(id: u32) -> Self {
        let start = 1u64 << id;
        let end = if id == 63 { u64::MAX } else { (1u64 << (id + 1)) - 1 };
        Self {
            id,
            start,
            end,
            available: end - start + 1,
            qualifier_size: [0; QUALIFIER_COUNT],
            segments: Default::default(),
            allocated: RangeSet::new(),
        }
    }

    /// Free ranges inside every qualifier segment that can hold `size` bytes.
    pub fn free_ranges(&self, qualifiers: Qualifiers, size: u64) -> RangeSet {
        let mut common: Option<RangeSet> = None;
        for q in qualifiers.iter() {
            let seg = &self.segments[q.slot()];
            common = Some(match common {
                None => seg.clone(),
                Some(acc) => acc.intersect(seg),
            });
        }
        let Some(common) = common else {
            return RangeSet::new();
        };
        let mut fitting = RangeSet::new();
        for (s, e) in common.subtract(&self.allocated).iter() {
            if e - s >= size - 1 {
                fitting.insert(s, e);
            }
        }
        fitting
    }

    /// Picks and records a start address inside `free`.
    pub fn allocate(
        &mut self,
        c: &AddressConstraint,
        qualifiers: Qualifiers,
        free: &RangeSet,
        rng: &mut dyn RandSource,
        filter: Option<&dyn CandidateFilter>,
    ) -> Option<u64> {
        let picked = if self.allocated.is_empty() || rng.with_probability_of(ANYWHERE_PERCENT) {
            self.anywhere(c, free, rng, filter)
        } else {
            self.near(c, free, rng, filter)
        };
        let start = picked
            .or_else(|| self.anywhere(c, free, rng, filter))
            .or_else(|| first_fit(c, free, filter))?;

        let end = start + c.size - 1;
        self.allocated.insert(start, end);
        self.available = self.available.saturating_sub(c.size);
        for q in qualifiers.iter() {
            let slot = q.slot();
            self.qualifier_size[slot] = self.qualifier_size[slot].saturating_sub(c.size);
        }
        debug!(target: "addrgen", "cluster {}: allocated {:#x}..={:#x}", self.id, start, end);
        Some(start)
    }

    fn fits(&self, free: &RangeSet, start: u64, size: u64, filter: Option<&dyn CandidateFilter>) -> bool {
        let Some(end) = start.checked_add(size - 1) else {
            return false;
        };
        free.covers(start, end) && filter.map_or(true, |f| f.accept(start))
    }

    fn anywhere(
        &self,
        c: &AddressConstraint,
        free: &RangeSet,
        rng: &mut dyn RandSource,
        filter: Option<&dyn CandidateFilter>,
    ) -> Option<u64> {
        let mut candidates: Vec<(u64, u64)> = free.iter().collect();
        while !candidates.is_empty() {
            let idx = rng.random_in_range(0, candidates.len() as u64 - 1) as usize;
            let (lo, hi) = candidates[idx];
            let last = hi - (c.size - 1);
            for _ in 0..TRIES_PER_RANGE {
                let start = rng.random_in_range(lo, last) & c.mask;
                if self.fits(free, start, c.size, filter) {
                    return Some(start);
                }
            }
            candidates.remove(idx);
        }
        None
    }

    /// Tries to place the range directly before or after an earlier allocation.
    fn near(
        &self,
        c: &AddressConstraint,
        free: &RangeSet,
        rng: &mut dyn RandSource,
        filter: Option<&dyn CandidateFilter>,
    ) -> Option<u64> {
        let mut neighbours: Vec<(u64, u64)> = self.allocated.iter().collect();
        shuffle(rng, &mut neighbours);
        for (s, e) in neighbours {
            let start = if rng.coin() {
                match s.checked_sub(c.size) {
                    Some(v) => v & c.mask,
                    None => continue,
                }
            } else {
                match e.checked_add(1) {
                    Some(v) => v & c.mask,
                    None => continue,
                }
            };
            if start < self.start {
                continue;
            }
            if self.fits(free, start, c.size, filter) {
                return Some(start);
            }
        }
        warn!(target: "addrgen", "cluster {}: no room next to existing allocations", self.id);
        None
    }
}

/// Lowest aligned start in `free`; only defined for contiguous masks.
fn first_fit(c: &AddressConstraint, free: &RangeSet, filter: Option<&dyn CandidateFilter>) -> Option<u64> {
    let align = c.alignment()?;
    for (s, e) in free.iter() {
        let mut start = s.checked_add(align - 1)? & c.mask;
        while let Some(end) = start.checked_add(c.size - 1) {
            if end > e {
                break;
            }
            if filter.map_or(true, |f| f.accept(start)) {
                return Some(start);
            }
            start = match start.checked_add(align) {
                Some(next) => next,
                None => break,
            };
        }
    }
    None
}
