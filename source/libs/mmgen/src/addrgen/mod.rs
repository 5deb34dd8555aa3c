// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address Allocator facade over the linear and physical spaces
//! OWNERS: @mmgen
//! PUBLIC API: AddrGen::{new, with_filter, reserve, generate, generate_identity, overlaps}
//! DEPENDS_ON: determinism::RandSource, memory::Memory
//! INVARIANTS: Ranges handed out or reserved within one kind never overlap;
//!             every result satisfies `addr & mask == addr` and `addr < 1 << bits`
//!
//! Ordering note: `reserve` only protects against later `generate` calls.
//! Reserving a range after an address was generated inside it is not
//! detected.

pub mod cluster;
pub mod filter;
pub mod range;
pub mod space;

#[cfg(test)]
mod tests_prop;

use log::{debug, info};

pub use filter::{CandidateFilter, IndexWindowLimit, WayPredictorHash};
pub use space::AddressSpace;

use crate::config::AddrFilterConfig;
use crate::determinism::RandSource;
use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::types::{AddressConstraint, AddressKind, Qualifiers};

/// Top of the linear space handed to the LINEAR qualifier.
pub const LINEAR_SPACE_END: u64 = (1 << 57) - 1;

pub struct AddrGen {
    linear: AddressSpace,
    physical: AddressSpace,
    filter: Option<Box<dyn CandidateFilter>>,
}

impl AddrGen {
    /// Builds both spaces from the memory map.
    pub fn new(mem: &Memory) -> Self {
        let mut linear = AddressSpace::new(AddressKind::Linear);
        let mut physical = AddressSpace::new(AddressKind::Physical);
        for r in mem.dram.iter().filter(|r| !r.is_empty()) {
            info!(target: "addrgen", "DRAM {:#018x}..={:#018x}", r.start, r.end());
            physical.define_segment(Qualifiers::DRAM, r.start, r.end());
        }
        for r in mem.io.iter().filter(|r| !r.is_empty()) {
            info!(target: "addrgen", "IO {:#018x}..={:#018x}", r.start, r.end());
            physical.define_segment(Qualifiers::MMIO, r.start, r.end());
        }
        for r in mem.secure.iter().filter(|r| !r.is_empty()) {
            info!(target: "addrgen", "secure {:#018x}..={:#018x}", r.start, r.end());
            physical.define_segment(Qualifiers::SECURE, r.start, r.end());
        }
        for r in mem.reserved.iter().filter(|r| !r.is_empty()) {
            info!(target: "addrgen", "reserved {:#018x}..={:#018x}", r.start, r.end());
            physical.reserve(r.start, r.end());
            linear.reserve(r.start, r.end());
            physical.define_segment(Qualifiers::RESERVED, r.start, r.end());
        }
        linear.define_segment(Qualifiers::LINEAR, 0, LINEAR_SPACE_END);
        Self { linear, physical, filter: None }
    }

    pub fn with_filter(mut self, filter: Box<dyn CandidateFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub(crate) fn with_filter_config(self, cfg: Option<AddrFilterConfig>) -> Self {
        match cfg {
            Some(cfg) => self.with_filter(filter::from_config(cfg)),
            None => self,
        }
    }

    pub fn space(&self, kind: AddressKind) -> &AddressSpace {
        match kind {
            AddressKind::Linear => &self.linear,
            AddressKind::Physical => &self.physical,
        }
    }

    fn space_mut(&mut self, kind: AddressKind) -> &mut AddressSpace {
        match kind {
            AddressKind::Linear => &mut self.linear,
            AddressKind::Physical => &mut self.physical,
        }
    }

    /// Marks `[start, start + size)` used in the `kind` space.
    pub fn reserve(&mut self, kind: AddressKind, start: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidConstraint("size cannot be 0"));
        }
        let end = start.saturating_add(size - 1);
        debug!(target: "addrgen", "reserve {} {:#x}..={:#x}", kind, start, end);
        self.space_mut(kind).reserve(start, end);
        Ok(())
    }

    pub fn overlaps(&self, kind: AddressKind, start: u64, size: u64) -> bool {
        size != 0 && self.space(kind).overlaps(start, start.saturating_add(size - 1))
    }

    /// Returns a fresh address satisfying `c`. Linear candidates also pass
    /// through the configured filter.
    pub fn generate(&mut self, c: &AddressConstraint, rng: &mut dyn RandSource) -> Result<u64> {
        c.validate()?;
        let addr = match c.kind {
            AddressKind::Physical => self.physical.generate(c, rng, None)?,
            AddressKind::Linear => {
                let addr = self.linear.generate(c, rng, self.filter.as_deref())?;
                if let Some(f) = self.filter.as_mut() {
                    f.record(addr);
                }
                addr
            }
        };
        debug!(target: "addrgen", "generated {} {:#x} for {}", c.kind, addr, c);
        Ok(addr)
    }

    /// Returns an address free in both spaces and reserves it in both, so it
    /// can be identity mapped. The constraint's qualifiers select the
    /// physical segment; candidates also pass the linear filter.
    pub fn generate_identity(&mut self, c: &AddressConstraint, rng: &mut dyn RandSource) -> Result<u64> {
        c.validate()?;
        let phys = AddressConstraint { kind: AddressKind::Physical, ..c.clone() };
        let free_linear = LinearFree { linear: &self.linear, size: c.size, inner: self.filter.as_deref() };
        let addr = self.physical.generate(&phys, rng, Some(&free_linear))?;
        self.linear.reserve(addr, addr + (c.size - 1));
        if let Some(f) = self.filter.as_mut() {
            f.record(addr);
        }
        debug!(target: "addrgen", "identity {:#x} for {}", addr, c);
        Ok(addr)
    }
}

/// Accepts physical candidates whose range is still unused in the linear space.
struct LinearFree<'a> {
    linear: &'a AddressSpace,
    size: u64,
    inner: Option<&'a dyn CandidateFilter>,
}

impl CandidateFilter for LinearFree<'_> {
    fn accept(&self, addr: u64) -> bool {
        let Some(end) = addr.checked_add(self.size - 1) else {
            return false;
        };
        !self.linear.overlaps(addr, end) && self.inner.map_or(true, |f| f.accept(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::SeededRng;
    use crate::memory::MemRange;

    fn small_memory() -> Memory {
        Memory {
            dram: vec![MemRange::new(0x8000_0000, 0x100_0000)],
            io: vec![MemRange::new(0x1000_0000, 0x1000)],
            secure: vec![MemRange::new(0x9000_0000, 0x10_0000)],
            reserved: vec![MemRange::new(0x8000_0000, 0x1000)],
        }
    }

    #[test]
    fn physical_defaults_to_dram() {
        let mut gen = AddrGen::new(&small_memory());
        let mut rng = SeededRng::new(5);
        for _ in 0..32 {
            let c = AddressConstraint::new(AddressKind::Physical, 0x1000);
            let addr = gen.generate(&c, &mut rng).expect("dram");
            assert!((0x8000_1000..0x8100_0000).contains(&addr));
        }
    }

    #[test]
    fn qualifiers_select_segments() {
        let mut gen = AddrGen::new(&small_memory());
        let mut rng = SeededRng::new(5);
        let io = AddressConstraint::new(AddressKind::Physical, 0x1000).with_qualifiers(Qualifiers::MMIO);
        assert_eq!(gen.generate(&io, &mut rng).expect("io"), 0x1000_0000);
        assert!(matches!(gen.generate(&io, &mut rng), Err(Error::AddressExhausted { .. })));

        let secure =
            AddressConstraint::new(AddressKind::Physical, 0x1000).with_qualifiers(Qualifiers::SECURE);
        let addr = gen.generate(&secure, &mut rng).expect("secure");
        assert!((0x9000_0000..0x9010_0000).contains(&addr));
    }

    #[test]
    fn linear_respects_bits() {
        let mut gen = AddrGen::new(&Memory::default());
        let mut rng = SeededRng::new(9);
        let c = AddressConstraint::new(AddressKind::Linear, 0x1000).with_bits(32);
        for _ in 0..64 {
            assert!(gen.generate(&c, &mut rng).expect("linear") < 1 << 32);
        }
    }

    #[test]
    fn reserved_memory_blocks_both_spaces() {
        let gen = AddrGen::new(&small_memory());
        assert!(gen.overlaps(AddressKind::Physical, 0x8000_0000, 1));
        assert!(gen.overlaps(AddressKind::Linear, 0x8000_0fff, 1));
        assert!(!gen.overlaps(AddressKind::Linear, 0x8000_1000, 0x1000));
    }

    #[test]
    fn identity_addresses_are_free_in_both_spaces() {
        let mut gen = AddrGen::new(&small_memory());
        let mut rng = SeededRng::new(2);
        let c = AddressConstraint::new(AddressKind::Physical, 0x2000);
        let addr = gen.generate_identity(&c, &mut rng).expect("identity");
        assert!(gen.overlaps(AddressKind::Physical, addr, 0x2000));
        assert!(gen.overlaps(AddressKind::Linear, addr, 0x2000));
    }

    #[test]
    fn way_predictor_filter_applies_to_linear_only() {
        let mut gen = AddrGen::new(&Memory::default()).with_filter(Box::new(WayPredictorHash));
        let mut rng = SeededRng::new(21);
        for _ in 0..64 {
            let c = AddressConstraint::new(AddressKind::Linear, 0x1000).with_bits(40);
            let addr = gen.generate(&c, &mut rng).expect("linear");
            assert_ne!(WayPredictorHash::hash(addr), 0);
        }
    }

    #[test]
    fn zero_sized_reserve_is_rejected() {
        let mut gen = AddrGen::new(&Memory::default());
        assert!(gen.reserve(AddressKind::Linear, 0x1000, 0).is_err());
    }

    #[test]
    fn identity_skips_reserved_linear_ranges() {
        let mut gen = AddrGen::new(&small_memory());
        let mut rng = SeededRng::new(4);
        // Only the top 64 KiB of DRAM stays free as a linear range.
        gen.reserve(AddressKind::Linear, 0x8000_0000, 0xff_0000).expect("reserve");
        let c = AddressConstraint::new(AddressKind::Physical, 0x4000).with_mask(!0x3fff);
        for _ in 0..4 {
            let addr = gen.generate_identity(&c, &mut rng).expect("identity");
            assert!(addr >= 0x80ff_0000, "{addr:#x} overlaps a linear reservation");
        }
        let err = gen.generate_identity(&c, &mut rng).expect_err("linear side is full");
        assert!(matches!(err, Error::AddressExhausted { .. }));
    }

    #[test]
    fn identity_addresses_count_against_the_linear_filter() {
        // Bits [13:12] give four windows holding one address each.
        let mut gen = AddrGen::new(&small_memory()).with_filter(Box::new(IndexWindowLimit::new(12, 13, 1)));
        let mut rng = SeededRng::new(8);
        let c = AddressConstraint::new(AddressKind::Physical, 0x1000);
        gen.generate_identity(&c, &mut rng).expect("identity");
        let linear = AddressConstraint::new(AddressKind::Linear, 0x1000).with_bits(32);
        for _ in 0..3 {
            gen.generate(&linear, &mut rng).expect("free window");
        }
        assert!(matches!(gen.generate(&linear, &mut rng), Err(Error::AddressExhausted { .. })));
    }
}
