// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page attribute overrides and their resolution into PTE bits
//! OWNERS: @mmgen
//! PUBLIC API: Attr, AttrTable, AttrPolicy, PteFlags, PteAttrs
//! DEPENDS_ON: bitflags, determinism::RandSource
//! INVARIANTS: Precedence is architecture default < combined (leaf only) < per-level;
//!             PBMT is only encoded on leaves
//!
//! Overrides are stored as a fixed `(attribute, vs-level, g-level)` matrix.
//! `None` means "not overridden" at that position.

use std::fmt;

use bitflags::bitflags;

use super::{MAX_LEVELS, PPN_MASK};
use crate::config::{GenConfig, PrivMode};
use crate::determinism::RandSource;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Single-bit fields of a RISC-V PTE.
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        const NAPOT = 1 << 63;
    }
}

const RSW_SHIFT: u32 = 8;
const RESERVED_SHIFT: u32 = 54;
const PBMT_SHIFT: u32 = 61;
const PPN_SHIFT: u32 = 10;

/// Page attribute identifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attr {
    Valid,
    Read,
    Write,
    Execute,
    User,
    Global,
    Accessed,
    Dirty,
    /// Software-reserved bits `[9:8]`.
    Rsw,
    /// Reserved bits `[60:54]`.
    Reserved,
    /// Memory-type hint `[62:61]`.
    Pbmt,
    Napot,
    Secure,
    /// Expose the tables this page walks through as writable mappings.
    ModifyPt,
}

pub const ATTR_COUNT: usize = 14;

impl Attr {
    pub const ALL: [Attr; ATTR_COUNT] = [
        Attr::Valid,
        Attr::Read,
        Attr::Write,
        Attr::Execute,
        Attr::User,
        Attr::Global,
        Attr::Accessed,
        Attr::Dirty,
        Attr::Rsw,
        Attr::Reserved,
        Attr::Pbmt,
        Attr::Napot,
        Attr::Secure,
        Attr::ModifyPt,
    ];

    #[inline]
    const fn idx(self) -> usize {
        self as usize
    }

    /// Mask of the value range accepted for this attribute.
    pub const fn value_mask(self) -> u8 {
        match self {
            Attr::Rsw | Attr::Pbmt => 0b11,
            Attr::Reserved => 0x7f,
            _ => 1,
        }
    }

    const fn flag(self) -> Option<PteFlags> {
        Some(match self {
            Attr::Valid => PteFlags::VALID,
            Attr::Read => PteFlags::READ,
            Attr::Write => PteFlags::WRITE,
            Attr::Execute => PteFlags::EXECUTE,
            Attr::User => PteFlags::USER,
            Attr::Global => PteFlags::GLOBAL,
            Attr::Accessed => PteFlags::ACCESSED,
            Attr::Dirty => PteFlags::DIRTY,
            Attr::Napot => PteFlags::NAPOT,
            _ => return None,
        })
    }
}

/// Override matrix of one page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrTable {
    combined: [Option<u8>; ATTR_COUNT],
    levels: [[Option<u8>; MAX_LEVELS]; ATTR_COUNT],
    nested: [[[Option<u8>; MAX_LEVELS]; MAX_LEVELS]; ATTR_COUNT],
}

impl AttrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the combined value, applied to the leaf entry.
    pub fn set(&mut self, attr: Attr, value: u8) -> &mut Self {
        self.combined[attr.idx()] = Some(value & attr.value_mask());
        self
    }

    /// Overrides `attr` in the entry written at `level`. Levels past
    /// `MAX_LEVELS` are ignored.
    pub fn set_level(&mut self, attr: Attr, level: usize, value: u8) -> &mut Self {
        if let Some(slot) = self.levels[attr.idx()].get_mut(level) {
            *slot = Some(value & attr.value_mask());
        }
        self
    }

    /// Overrides `attr` in the G-stage entry at `g_level` that maps the frame
    /// introduced at VS level `vs_level`.
    pub fn set_nested(&mut self, attr: Attr, vs_level: usize, g_level: usize, value: u8) -> &mut Self {
        let slot = self.nested[attr.idx()].get_mut(vs_level).and_then(|row| row.get_mut(g_level));
        if let Some(slot) = slot {
            *slot = Some(value & attr.value_mask());
        }
        self
    }

    pub fn combined(&self, attr: Attr) -> Option<u8> {
        self.combined[attr.idx()]
    }

    pub fn level(&self, attr: Attr, level: usize) -> Option<u8> {
        self.levels[attr.idx()].get(level).copied().flatten()
    }

    pub fn nested(&self, attr: Attr, vs_level: usize, g_level: usize) -> Option<u8> {
        self.nested[attr.idx()].get(vs_level).and_then(|row| row.get(g_level)).copied().flatten()
    }

    /// True when the combined value is set and nonzero.
    pub fn is_set(&self, attr: Attr) -> bool {
        self.combined(attr).unwrap_or(0) != 0
    }

    /// Explicit value for an entry at `level`, per-level winning over combined.
    fn explicit(&self, attr: Attr, level: usize, leaf: bool) -> Option<u8> {
        let combined = if leaf { self.combined(attr) } else { None };
        self.level(attr, level).or(combined)
    }

    /// Overrides for a G-stage shadow page of the frame introduced at VS
    /// level `vs_level`: the `(vs_level, g)` row becomes the G map's per-level
    /// table.
    pub fn shadow_for(&self, vs_level: usize) -> AttrTable {
        let mut out = AttrTable::new();
        out.set(Attr::Execute, 1);
        for attr in Attr::ALL {
            for g in 0..MAX_LEVELS {
                if let Some(v) = self.nested(attr, vs_level, g) {
                    out.set_level(attr, g, v);
                }
            }
        }
        out
    }
}

/// Run-wide inputs to attribute resolution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttrPolicy {
    pub user: bool,
    pub svadu: bool,
    pub ad_probability: u32,
    pub secure_mode: bool,
    pub secure_probability: u32,
    pub pbmt_ncio: bool,
}

impl AttrPolicy {
    pub fn from_config(cfg: &GenConfig) -> Self {
        Self {
            user: cfg.priv_mode == PrivMode::User || cfg.paging_mode == super::PagingMode::Bare,
            svadu: cfg.svadu,
            ad_probability: cfg.ad_probability,
            secure_mode: cfg.secure_mode,
            secure_probability: cfg.secure_access_probability,
            pbmt_ncio: cfg.pbmt_ncio,
        }
    }

    /// Resolves the entry written at `level`. `gstage` marks entries of a
    /// G-stage map, whose leaves always carry U.
    pub fn resolve(
        &self,
        table: &AttrTable,
        level: usize,
        leaf: bool,
        gstage: bool,
        allow_pbmt_ncio: bool,
        rng: &mut dyn RandSource,
    ) -> PteAttrs {
        let mut out = PteAttrs { leaf, ..PteAttrs::default() };
        for attr in Attr::ALL {
            let value = match table.explicit(attr, level, leaf) {
                Some(v) => v,
                None => self.default_value(attr, leaf, gstage, allow_pbmt_ncio, rng),
            };
            out.apply(attr, value);
        }
        out
    }

    fn default_value(
        &self,
        attr: Attr,
        leaf: bool,
        gstage: bool,
        allow_pbmt_ncio: bool,
        rng: &mut dyn RandSource,
    ) -> u8 {
        match attr {
            Attr::Valid => 1,
            _ if !leaf => 0,
            Attr::Read | Attr::Write | Attr::Execute => 1,
            Attr::User => u8::from(gstage || self.user),
            Attr::Accessed | Attr::Dirty => {
                if self.svadu {
                    u8::from(rng.with_probability_of(self.ad_probability))
                } else {
                    1
                }
            }
            Attr::Secure => u8::from(self.secure_mode && rng.with_probability_of(self.secure_probability)),
            Attr::Pbmt if self.pbmt_ncio && allow_pbmt_ncio => 1 + u8::from(rng.coin()),
            _ => 0,
        }
    }
}

/// Final bit values for one entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PteAttrs {
    pub flags: PteFlags,
    pub rsw: u8,
    pub reserved: u8,
    pub pbmt: u8,
    pub secure: bool,
    pub leaf: bool,
}

impl PteAttrs {
    fn apply(&mut self, attr: Attr, value: u8) {
        if let Some(flag) = attr.flag() {
            self.flags.set(flag, value != 0);
            return;
        }
        match attr {
            Attr::Rsw => self.rsw = value,
            Attr::Reserved => self.reserved = value,
            Attr::Pbmt => self.pbmt = value,
            Attr::Secure => self.secure = value != 0,
            _ => {}
        }
    }

    /// Attribute bits of the entry, without the PPN.
    pub fn bits(&self) -> u64 {
        let mut raw = self.flags.bits()
            | (u64::from(self.rsw) << RSW_SHIFT)
            | (u64::from(self.reserved) << RESERVED_SHIFT);
        if self.leaf {
            raw |= u64::from(self.pbmt) << PBMT_SHIFT;
        }
        raw
    }

    /// Full entry pointing at `target`.
    pub fn encode(&self, target: u64) -> u64 {
        (((target >> 12) & PPN_MASK) << PPN_SHIFT) | self.bits()
    }
}

/// Target address stored in a raw entry.
#[inline]
pub fn entry_target(raw: u64) -> u64 {
    ((raw >> PPN_SHIFT) & PPN_MASK) << 12
}

impl fmt::Display for PteAttrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PteFlags, char); 8] = [
            (PteFlags::DIRTY, 'd'),
            (PteFlags::ACCESSED, 'a'),
            (PteFlags::GLOBAL, 'g'),
            (PteFlags::USER, 'u'),
            (PteFlags::EXECUTE, 'x'),
            (PteFlags::WRITE, 'w'),
            (PteFlags::READ, 'r'),
            (PteFlags::VALID, 'v'),
        ];
        for (flag, c) in NAMES {
            let shown = if self.flags.contains(flag) { c } else { '-' };
            write!(f, "{shown}")?;
        }
        if self.leaf && self.pbmt != 0 {
            write!(f, " pbmt={}", self.pbmt)?;
        }
        if self.rsw != 0 {
            write!(f, " rsw={}", self.rsw)?;
        }
        if self.reserved != 0 {
            write!(f, " rsvd={:#x}", self.reserved)?;
        }
        if self.flags.contains(PteFlags::NAPOT) {
            f.write_str(" n")?;
        }
        if self.secure {
            f.write_str(" secure")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::determinism::testing::ScriptedRng;

    fn supervisor() -> AttrPolicy {
        AttrPolicy { ad_probability: 50, secure_probability: 30, ..AttrPolicy::default() }
    }

    #[test]
    fn non_leaf_defaults_to_pointer_only() {
        let attrs = supervisor().resolve(&AttrTable::new(), 2, false, false, true, &mut ScriptedRng::low());
        assert_eq!(attrs.flags, PteFlags::VALID);
        assert_eq!(attrs.bits(), 0x1);
    }

    #[test]
    fn leaf_defaults_follow_privilege() {
        let mut rng = ScriptedRng::low();
        let s = supervisor().resolve(&AttrTable::new(), 0, true, false, true, &mut rng);
        assert_eq!(s.bits(), 0xcf);
        let user = AttrPolicy { user: true, ..supervisor() };
        assert_eq!(user.resolve(&AttrTable::new(), 0, true, false, true, &mut rng).bits(), 0xdf);
        let g = supervisor().resolve(&AttrTable::new(), 1, true, true, true, &mut rng);
        assert!(g.flags.contains(PteFlags::USER));
    }

    #[test]
    fn combined_applies_to_leaf_and_per_level_wins() {
        let mut table = AttrTable::new();
        table.set(Attr::Execute, 0).set(Attr::Write, 0).set_level(Attr::Write, 0, 1);
        table.set_level(Attr::Accessed, 2, 1);
        let mut rng = ScriptedRng::low();
        let leaf = supervisor().resolve(&table, 0, true, false, true, &mut rng);
        assert!(!leaf.flags.contains(PteFlags::EXECUTE));
        assert!(leaf.flags.contains(PteFlags::WRITE));
        let upper = supervisor().resolve(&table, 2, false, false, true, &mut rng);
        assert_eq!(upper.flags, PteFlags::VALID | PteFlags::ACCESSED);
        let mid = supervisor().resolve(&table, 1, false, false, true, &mut rng);
        assert!(!mid.flags.contains(PteFlags::EXECUTE));
    }

    #[test]
    fn svadu_rolls_access_bits() {
        let policy = AttrPolicy { svadu: true, ..supervisor() };
        let cleared = policy.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::high());
        assert!(!cleared.flags.intersects(PteFlags::ACCESSED | PteFlags::DIRTY));
        let set = policy.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::low());
        assert!(set.flags.contains(PteFlags::ACCESSED | PteFlags::DIRTY));
        let mut pinned = AttrTable::new();
        pinned.set(Attr::Dirty, 1);
        let out = policy.resolve(&pinned, 0, true, false, true, &mut ScriptedRng::high());
        assert!(out.flags.contains(PteFlags::DIRTY));
        assert!(!out.flags.contains(PteFlags::ACCESSED));
    }

    #[test]
    fn secure_roll_only_in_secure_mode() {
        let secure = AttrPolicy { secure_mode: true, ..supervisor() };
        assert!(secure.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::low()).secure);
        assert!(!secure.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::high()).secure);
        assert!(!supervisor().resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::low()).secure);
    }

    #[test]
    fn pbmt_is_leaf_only() {
        let mut table = AttrTable::new();
        table.set(Attr::Pbmt, 2).set_level(Attr::Pbmt, 1, 1);
        let mut rng = ScriptedRng::low();
        let leaf = supervisor().resolve(&table, 0, true, false, true, &mut rng);
        assert_eq!(leaf.bits() >> PBMT_SHIFT, 2);
        let upper = supervisor().resolve(&table, 1, false, false, true, &mut rng);
        assert_eq!(upper.pbmt, 1);
        assert_eq!(upper.bits() >> PBMT_SHIFT, 0);
    }

    #[test]
    fn pbmt_ncio_randomizes_unless_opted_out() {
        let policy = AttrPolicy { pbmt_ncio: true, ..supervisor() };
        let nc = policy.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::high());
        assert_eq!(nc.pbmt, 1);
        let io = policy.resolve(&AttrTable::new(), 0, true, false, true, &mut ScriptedRng::low());
        assert_eq!(io.pbmt, 2);
        let off = policy.resolve(&AttrTable::new(), 0, true, false, false, &mut ScriptedRng::low());
        assert_eq!(off.pbmt, 0);
    }

    #[test]
    fn values_are_masked_to_field_width() {
        let mut table = AttrTable::new();
        table.set(Attr::Rsw, 0xff).set(Attr::Valid, 2);
        assert_eq!(table.combined(Attr::Rsw), Some(0b11));
        assert_eq!(table.combined(Attr::Valid), Some(0));
    }

    #[test]
    fn encode_places_ppn_and_fields() {
        let attrs = PteAttrs { flags: PteFlags::VALID, rsw: 0b10, reserved: 0x7f, ..PteAttrs::default() };
        let raw = attrs.encode(0x8000_1000);
        assert_eq!(raw & 0x3ff, 0x201);
        assert_eq!((raw >> 54) & 0x7f, 0x7f);
        assert_eq!(entry_target(raw), 0x8000_1000);
    }

    #[test]
    fn shadow_table_takes_nested_row() {
        let mut table = AttrTable::new();
        table.set_nested(Attr::User, 1, 0, 0).set_nested(Attr::Accessed, 1, 2, 1).set_nested(Attr::Dirty, 0, 0, 0);
        let shadow = table.shadow_for(1);
        assert_eq!(shadow.level(Attr::User, 0), Some(0));
        assert_eq!(shadow.level(Attr::Accessed, 2), Some(1));
        assert_eq!(shadow.level(Attr::Dirty, 0), None);
        assert_eq!(shadow.combined(Attr::Execute), Some(1));
    }

    #[test]
    fn display_lists_flags_high_to_low() {
        let attrs = PteAttrs { flags: PteFlags::VALID | PteFlags::READ, leaf: true, ..PteAttrs::default() };
        assert_eq!(attrs.to_string(), "------rv");
    }
}
