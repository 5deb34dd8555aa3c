// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! One address space (linear or physical) split into 64 clusters.

use std::collections::BTreeSet;

use log::debug;

use super::cluster::Cluster;
use super::filter::CandidateFilter;
use crate::determinism::{shuffle, RandSource};
use crate::error::{Error, Result};
use crate::types::{AddressConstraint, AddressKind, Qualifiers, QUALIFIER_COUNT};

const CLUSTER_COUNT: u32 = 64;

/// Index of the cluster holding `addr`. Address 0 belongs to cluster 0.
#[inline]
pub(crate) fn cluster_of(addr: u64) -> u32 {
    if addr == 0 {
        0
    } else {
        63 - addr.leading_zeros()
    }
}

/// Clusters whose start bit survives `mask` below `min(bit_length(mask), bits)`.
pub(crate) fn possible_clusters(mask: u64, bits: u32) -> BTreeSet<u32> {
    let bitlen = (64 - mask.leading_zeros()).min(bits);
    (0..bitlen).filter(|i| (mask >> i) & 1 == 1).collect()
}

#[derive(Clone, Debug)]
pub struct AddressSpace {
    kind: AddressKind,
    clusters: Vec<Cluster>,
    valid: BTreeSet<u32>,
    by_qualifier: [BTreeSet<u32>; QUALIFIER_COUNT],
}

impl AddressSpace {
    pub fn new(kind: AddressKind) -> Self {
        Self {
            kind,
            clusters: (0..CLUSTER_COUNT).map(Cluster::new).collect(),
            valid: BTreeSet::new(),
            by_qualifier: Default::default(),
        }
    }

    #[inline]
    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    pub fn is_defined(&self, qualifier: Qualifiers) -> bool {
        !self.by_qualifier[qualifier.slot()].is_empty()
    }

    /// Tags `[start, end]` with `qualifier`, splitting it across clusters.
    pub fn define_segment(&mut self, qualifier: Qualifiers, start: u64, end: u64) {
        if start > end {
            return;
        }
        debug!(target: "addrgen", "{}: {:?} segment {:#x}..={:#x}", self.kind, qualifier, start, end);
        let slot = qualifier.slot();
        let (first, last) = (cluster_of(start), cluster_of(end));
        for id in first..=last {
            let cluster = &mut self.clusters[id as usize];
            let s = if id == first { start } else { cluster.start };
            let e = if id == last { end } else { cluster.end };
            cluster.segments[slot].insert(s, e);
            cluster.qualifier_size[slot] = cluster.qualifier_size[slot].saturating_add(e - s + 1);
            self.valid.insert(id);
            self.by_qualifier[slot].insert(id);
        }
    }

    /// Marks `[start, end]` used.
    pub fn reserve(&mut self, start: u64, end: u64) {
        let (first, last) = (cluster_of(start), cluster_of(end));
        for id in first..=last {
            let cluster = &mut self.clusters[id as usize];
            let s = if id == first { start } else { cluster.start };
            let e = if id == last { end } else { cluster.end };
            cluster.allocated.insert(s, e);
            cluster.available = cluster.available.saturating_sub(e - s + 1);
        }
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        (cluster_of(start)..=cluster_of(end)).any(|id| self.clusters[id as usize].allocated.overlaps(start, end))
    }

    fn default_qualifier(&self) -> Qualifiers {
        match self.kind {
            AddressKind::Physical => Qualifiers::DRAM,
            AddressKind::Linear => Qualifiers::LINEAR,
        }
    }

    /// Candidate clusters for `c`, before shuffling.
    fn find_clusters(&self, c: &AddressConstraint, qualifiers: Qualifiers) -> Result<Vec<u32>> {
        let mut clusters: BTreeSet<u32> =
            possible_clusters(c.mask, c.bits).intersection(&self.valid).copied().collect();
        for q in qualifiers.iter() {
            let defined = &self.by_qualifier[q.slot()];
            if defined.is_empty() {
                return Err(Error::UndefinedQualifier { qualifier: q, kind: self.kind });
            }
            clusters = clusters.intersection(defined).copied().collect();
        }
        Ok(clusters
            .into_iter()
            .filter(|&id| {
                let cluster = &self.clusters[id as usize];
                cluster.available >= c.size
                    && qualifiers.iter().all(|q| cluster.qualifier_size[q.slot()] >= c.size)
            })
            .collect())
    }

    /// Generates and records an address satisfying `c` inside this space.
    pub fn generate(
        &mut self,
        c: &AddressConstraint,
        rng: &mut dyn RandSource,
        filter: Option<&dyn CandidateFilter>,
    ) -> Result<u64> {
        let qualifiers =
            if c.qualifiers.is_empty() { self.default_qualifier() } else { c.qualifiers };
        let mut candidates = self.find_clusters(c, qualifiers)?;
        if candidates.is_empty() {
            return Err(Error::AddressExhausted { constraint: c.clone() });
        }
        shuffle(rng, &mut candidates);
        for id in candidates {
            let cluster = &mut self.clusters[id as usize];
            let free = cluster.free_ranges(qualifiers, c.size);
            if free.is_empty() {
                debug!(target: "addrgen", "{}: cluster {} has no fitting range", self.kind, id);
                continue;
            }
            if let Some(addr) = cluster.allocate(c, qualifiers, &free, rng, filter) {
                return Ok(addr);
            }
        }
        Err(Error::AddressExhausted { constraint: c.clone() })
    }
}
