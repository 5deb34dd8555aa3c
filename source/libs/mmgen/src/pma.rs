// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical Memory Attribute classification and pmacfg packing
//! OWNERS: @mmgen
//! PUBLIC API: PmaInfo, PmaRegion::{add_region, add_entry, consolidated_entries},
//!             MemoryType, AmoType, Routing
//! DEPENDS_ON: error::Error
//! INVARIANTS: Consolidated entries are sorted and never overlap; memory entries
//!             merge only when adjacent or overlapping, IO entries also across gaps
//!
//! Packed layout of one descriptor:
//!   [2:0]   r/w/x permission
//!   [4:3]   memory type
//!   [6:5]   AMO class
//!   [7]     cacheable (memory) or combining (other types)
//!   [8]     coherent routing
//!   [51:12] base address >> 12
//!   [63:58] size code, index of the highest set bit of size plus one

use std::fmt;

use log::debug;

use crate::error::{Error, Result};

const ADDR_MASK: u64 = (1 << 40) - 1;
const SIZE_CODE_SHIFT: u32 = 58;
/// Widest size the six-bit code can express.
const MAX_SIZE_MSB: u32 = 62;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryType {
    #[default]
    Memory,
    Io,
    Ch0,
    Ch1,
}

impl MemoryType {
    const fn code(self) -> u64 {
        match self {
            Self::Memory => 0,
            Self::Io => 1,
            Self::Ch0 => 2,
            Self::Ch1 => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AmoType {
    None,
    Logical,
    Swap,
    #[default]
    Arithmetic,
}

impl AmoType {
    const fn code(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Logical => 1,
            Self::Swap => 2,
            Self::Arithmetic => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Routing {
    #[default]
    Coherent,
    NonCoherent,
}

/// One attribute-tagged physical range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PmaInfo {
    pub name: Option<String>,
    /// Invalid descriptors pack to zero.
    pub valid: bool,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub memory_type: MemoryType,
    pub amo: AmoType,
    pub cacheable: bool,
    pub combining: bool,
    pub routing: Routing,
    pub address: u64,
    pub size: u64,
}

impl Default for PmaInfo {
    fn default() -> Self {
        Self {
            name: None,
            valid: true,
            read: true,
            write: true,
            execute: true,
            memory_type: MemoryType::Memory,
            amo: AmoType::Arithmetic,
            cacheable: true,
            combining: false,
            routing: Routing::Coherent,
            address: 0,
            size: 0,
        }
    }
}

impl PmaInfo {
    pub fn new(address: u64, size: u64, memory_type: MemoryType) -> Self {
        Self { address, size, memory_type, ..Self::default() }
    }

    /// Exclusive end, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn is_io(&self) -> bool {
        self.memory_type == MemoryType::Io
    }

    pub fn contains(&self, other: &PmaInfo) -> bool {
        self.address <= other.address && other.end() <= self.end()
    }

    /// True when every attribute other than the range itself agrees.
    pub fn attrs_match(&self, other: &PmaInfo) -> bool {
        self.valid == other.valid
            && self.read == other.read
            && self.write == other.write
            && self.execute == other.execute
            && self.memory_type == other.memory_type
            && self.amo == other.amo
            && self.cacheable == other.cacheable
            && self.combining == other.combining
            && self.routing == other.routing
    }

    /// Packs the descriptor. Sizes must be a power of two.
    pub fn generate_pma_value(&self) -> Result<u64> {
        if !self.valid {
            return Ok(0);
        }
        if !self.size.is_power_of_two() {
            return Err(Error::PmaSizeNotPowerOfTwo(self.size));
        }
        let msb = self.size.trailing_zeros();
        if msb > MAX_SIZE_MSB {
            return Err(Error::PmaSizeOutOfRange(self.size));
        }
        let type_bit = if self.memory_type == MemoryType::Memory { self.cacheable } else { self.combining };
        let mut value = u64::from(self.read) | u64::from(self.write) << 1 | u64::from(self.execute) << 2;
        value |= self.memory_type.code() << 3;
        value |= self.amo.code() << 5;
        value |= u64::from(type_bit) << 7;
        value |= u64::from(self.routing == Routing::Coherent) << 8;
        value |= ((self.address >> 12) & ADDR_MASK) << 12;
        value |= u64::from(msb + 1) << SIZE_CODE_SHIFT;
        Ok(value)
    }
}

impl fmt::Display for PmaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "{name}: ")?;
        }
        write!(
            f,
            "{:?} {:#x}+{:#x} {:?} amo={:?} {}{}{}",
            self.memory_type,
            self.address,
            self.size,
            self.routing,
            self.amo,
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
        )?;
        if self.cacheable {
            f.write_str(" cacheable")?;
        }
        if self.combining {
            f.write_str(" combining")?;
        }
        Ok(())
    }
}

/// Accumulates descriptors and folds them into a minimal covering list.
#[derive(Clone, Debug, Default)]
pub struct PmaRegion {
    entries: Vec<PmaInfo>,
}

impl PmaRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `[base, base + size)` with default attributes for `memory_type`.
    pub fn add_region(&mut self, base: u64, size: u64, memory_type: MemoryType) -> &mut PmaInfo {
        self.add_entry(PmaInfo::new(base, size, memory_type))
    }

    pub fn add_entry(&mut self, info: PmaInfo) -> &mut PmaInfo {
        debug!(target: "pma", "add {info}");
        self.entries.push(info);
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    pub fn entries(&self) -> &[PmaInfo] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted, merged descriptors. Matching memory entries fold when they touch
    /// or overlap; matching IO entries also absorb the gap between them.
    pub fn consolidated_entries(&self) -> Vec<PmaInfo> {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|e| e.address);
        let mut out: Vec<PmaInfo> = Vec::with_capacity(sorted.len());
        for entry in sorted {
            let Some(last) = out.last_mut() else {
                out.push(entry);
                continue;
            };
            if !last.attrs_match(&entry) {
                out.push(entry);
            } else if last.contains(&entry) {
                continue;
            } else if entry.address <= last.end() || last.is_io() {
                last.size = entry.end() - last.address;
            } else {
                out.push(entry);
            }
        }
        debug!(target: "pma", "{} entries consolidated into {}", self.entries.len(), out.len());
        out
    }
}
