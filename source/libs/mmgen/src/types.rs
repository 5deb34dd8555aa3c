// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Value types shared by the allocator, the maps and the output bundle
//! OWNERS: @mmgen
//! PUBLIC API: AddressKind, Qualifiers, AddressConstraint, Address, AddressTable
//! DEPENDS_ON: bitflags
//! INVARIANTS: Address names are unique per kind unless inserted as an alias

use std::collections::BTreeMap;
use std::fmt;

use bitflags::bitflags;

use crate::error::{Error, Result};

/// Default alignment mask for generated addresses (4 KiB).
pub const DEFAULT_ADDR_MASK: u64 = 0xFFFF_FFFF_FFFF_F000;

/// Address space an address belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressKind {
    Linear,
    Physical,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear => f.write_str("linear"),
            Self::Physical => f.write_str("physical"),
        }
    }
}

bitflags! {
    /// Segment qualifiers an address must fall inside.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Qualifiers: u8 {
        const LINEAR = 1 << 0;
        const DRAM = 1 << 1;
        const MMIO = 1 << 2;
        const SECURE = 1 << 3;
        const RESERVED = 1 << 4;
    }
}

/// Number of distinct qualifier bits.
pub const QUALIFIER_COUNT: usize = 5;

impl Qualifiers {
    /// Slot of a single-bit qualifier in per-qualifier tables.
    #[inline]
    pub(crate) fn slot(self) -> usize {
        debug_assert_eq!(self.bits().count_ones(), 1);
        self.bits().trailing_zeros() as usize
    }
}

/// Requirements a generated address must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressConstraint {
    pub kind: AddressKind,
    pub qualifiers: Qualifiers,
    /// Generated addresses stay below `1 << bits`.
    pub bits: u32,
    pub size: u64,
    /// Alignment mask; `addr & mask == addr` for every result.
    pub mask: u64,
}

impl AddressConstraint {
    /// A 4 KiB aligned request of `size` bytes with no qualifier and the full
    /// 64-bit range.
    pub fn new(kind: AddressKind, size: u64) -> Self {
        Self { kind, qualifiers: Qualifiers::empty(), bits: 64, size, mask: DEFAULT_ADDR_MASK }
    }

    pub fn with_bits(mut self, bits: u32) -> Self {
        self.bits = bits;
        self
    }

    pub fn with_mask(mut self, mask: u64) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_qualifiers(mut self, qualifiers: Qualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    /// Sets the mask so results are aligned to `align` (a power of two).
    pub fn aligned_to(mut self, align: u64) -> Self {
        self.mask = !(align.max(1) - 1);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidConstraint("size cannot be 0"));
        }
        if self.mask == 0 {
            return Err(Error::InvalidConstraint("mask cannot be 0"));
        }
        if self.bits == 0 || self.bits > 64 {
            return Err(Error::InvalidConstraint("bits must be within 1..=64"));
        }
        Ok(())
    }

    /// Returns the alignment implied by a contiguous high-bit mask.
    pub(crate) fn alignment(&self) -> Option<u64> {
        let low = !self.mask;
        if low & low.wrapping_add(1) == 0 {
            low.checked_add(1)
        } else {
            None
        }
    }
}

impl fmt::Display for AddressConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} size={:#x} mask={:#018x} bits={} qualifiers={:?}",
            self.kind, self.size, self.mask, self.bits, self.qualifiers
        )
    }
}

/// A resolved, named address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub name: String,
    pub kind: AddressKind,
    pub value: u64,
    pub size: u64,
}

impl Address {
    pub fn new(name: impl Into<String>, kind: AddressKind, value: u64, size: u64) -> Self {
        Self { name: name.into(), kind, value, size }
    }

    /// Last byte covered by this address.
    #[inline]
    pub fn end(&self) -> u64 {
        self.value.saturating_add(self.size.saturating_sub(1))
    }
}

/// Name keyed table of resolved addresses, one namespace per kind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressTable {
    linear: BTreeMap<String, Address>,
    physical: BTreeMap<String, Address>,
}

impl AddressTable {
    fn space(&self, kind: AddressKind) -> &BTreeMap<String, Address> {
        match kind {
            AddressKind::Linear => &self.linear,
            AddressKind::Physical => &self.physical,
        }
    }

    fn space_mut(&mut self, kind: AddressKind) -> &mut BTreeMap<String, Address> {
        match kind {
            AddressKind::Linear => &mut self.linear,
            AddressKind::Physical => &mut self.physical,
        }
    }

    /// Registers `addr`, rejecting a name already used for the same kind.
    pub fn insert(&mut self, addr: Address) -> Result<()> {
        let space = self.space_mut(addr.kind);
        if space.contains_key(&addr.name) {
            return Err(Error::DuplicateAddress(addr.name));
        }
        space.insert(addr.name.clone(), addr);
        Ok(())
    }

    /// Registers `addr` as an alias; an existing entry of that name is replaced.
    pub fn insert_alias(&mut self, addr: Address) {
        self.space_mut(addr.kind).insert(addr.name.clone(), addr);
    }

    /// Registers `addr` unless the name is taken. Returns whether it was added.
    pub fn insert_if_absent(&mut self, addr: Address) -> bool {
        let space = self.space_mut(addr.kind);
        if space.contains_key(&addr.name) {
            return false;
        }
        space.insert(addr.name.clone(), addr);
        true
    }

    pub fn get(&self, kind: AddressKind, name: &str) -> Option<&Address> {
        self.space(kind).get(name)
    }

    pub fn value(&self, kind: AddressKind, name: &str) -> Option<u64> {
        self.get(kind, name).map(|a| a.value)
    }

    pub fn contains(&self, kind: AddressKind, name: &str) -> bool {
        self.space(kind).contains_key(name)
    }

    /// Addresses of `kind` in name order.
    pub fn iter(&self, kind: AddressKind) -> impl Iterator<Item = &Address> {
        self.space(kind).values()
    }

    pub fn len(&self) -> usize {
        self.linear.len() + self.physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected_per_kind() {
        let mut table = AddressTable::default();
        table.insert(Address::new("code", AddressKind::Linear, 0x1000, 0x1000)).expect("first");
        table.insert(Address::new("code", AddressKind::Physical, 0x8000_0000, 0x1000)).expect("other kind");
        let err = table.insert(Address::new("code", AddressKind::Linear, 0x2000, 0x1000));
        assert!(matches!(err, Err(Error::DuplicateAddress(name)) if name == "code"));
        assert_eq!(table.value(AddressKind::Linear, "code"), Some(0x1000));
    }

    #[test]
    fn alias_replaces_existing_entry() {
        let mut table = AddressTable::default();
        table.insert(Address::new("data", AddressKind::Physical, 0x8000_0000, 0x1000)).expect("insert");
        table.insert_alias(Address::new("data", AddressKind::Physical, 0x8000_2000, 0x1000));
        assert_eq!(table.value(AddressKind::Physical, "data"), Some(0x8000_2000));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn constraint_validation() {
        assert!(AddressConstraint::new(AddressKind::Linear, 0).validate().is_err());
        assert!(AddressConstraint::new(AddressKind::Linear, 0x1000).with_mask(0).validate().is_err());
        assert!(AddressConstraint::new(AddressKind::Linear, 0x1000).with_bits(65).validate().is_err());
        assert!(AddressConstraint::new(AddressKind::Linear, 0x1000).validate().is_ok());
    }

    #[test]
    fn alignment_from_mask() {
        let c = AddressConstraint::new(AddressKind::Physical, 0x20_0000).aligned_to(0x20_0000);
        assert_eq!(c.mask, 0xFFFF_FFFF_FFE0_0000);
        assert_eq!(c.alignment(), Some(0x20_0000));
        assert_eq!(c.clone().with_mask(0xFFFF_0F00).alignment(), None);
        assert_eq!(c.with_mask(u64::MAX).alignment(), Some(1));
    }
}
