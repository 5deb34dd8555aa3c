// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical Memory Protection entries and pmpcfg/pmpaddr encoding
//! OWNERS: @mmgen
//! PUBLIC API: PmpEntry, PmpRegion::{add_region, encode}, PmpRegisters, PmpPerms,
//!             AddressMatching, Xlen, PmpError
//! DEPENDS_ON: bitflags, thiserror
//! INVARIANTS: At most 64 entries; every entry added by `add_region` is NAPOT;
//!             entry `i` occupies byte `i % per_reg` of its pmpcfg register

use bitflags::bitflags;
use log::{debug, info};
use thiserror::Error;

/// Address granule of pmpaddr registers.
pub const PMP_GRANULE: u64 = 4;
/// Smallest NAPOT region.
pub const PMP_NAPOT_GRANULE: u64 = 8;
pub const PMP_ENTRIES: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PmpError {
    #[error("NA4 entry needs size 4, got {0:#x}")]
    Na4Size(u64),
    #[error("NAPOT size {0:#x} must be a power of two of at least 8 bytes")]
    NapotSize(u64),
    #[error("region {base:#x}+{size:#x} cannot be covered by NAPOT entries")]
    Unaligned { base: u64, size: u64 },
    #[error("no PMP slots left")]
    SlotsExhausted,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PmpPerms: u8 {
        const R = 1 << 0;
        const W = 1 << 1;
        const X = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddressMatching {
    #[default]
    Off,
    Tor,
    Na4,
    Napot,
}

impl AddressMatching {
    /// Value of the `A` field.
    pub const fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Tor => 1,
            Self::Na4 => 2,
            Self::Napot => 3,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    #[default]
    Rv64,
}

impl Xlen {
    /// Entries packed into one pmpcfg register.
    pub const fn entries_per_cfg(self) -> usize {
        match self {
            Self::Rv32 => 4,
            Self::Rv64 => 8,
        }
    }
}

/// One logical protection entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpEntry {
    pub base: u64,
    pub size: u64,
    pub perms: PmpPerms,
    pub matching: AddressMatching,
}

impl PmpEntry {
    pub fn napot(base: u64, size: u64, perms: PmpPerms) -> Self {
        Self { base, size, perms, matching: AddressMatching::Napot }
    }

    /// pmpaddr value of this entry.
    pub fn encode_addr(&self) -> Result<u64, PmpError> {
        match self.matching {
            AddressMatching::Off => Ok(0),
            AddressMatching::Tor => Ok(self.base.wrapping_add(self.size) / PMP_GRANULE),
            AddressMatching::Na4 => {
                if self.size != PMP_GRANULE {
                    return Err(PmpError::Na4Size(self.size));
                }
                Ok(self.base / PMP_GRANULE)
            }
            AddressMatching::Napot => {
                if self.size < PMP_NAPOT_GRANULE || !self.size.is_power_of_two() {
                    return Err(PmpError::NapotSize(self.size));
                }
                let mask = (self.size / PMP_GRANULE - 1) >> 1;
                Ok((self.base / PMP_GRANULE) | mask)
            }
        }
    }

    /// pmpcfg byte of this entry.
    pub fn encode_cfg(&self) -> u8 {
        self.perms.bits() | (self.matching.code() << 3)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpAddr {
    pub index: usize,
    pub value: u64,
    pub matching: AddressMatching,
}

impl PmpAddr {
    /// `(base, size)` covered by a NAPOT or NA4 register.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self.matching {
            AddressMatching::Napot => {
                let ones = self.value.trailing_ones();
                let size = 1u64.checked_shl(ones + 3)?;
                let base = (self.value & !((1u64 << ones) - 1)) << 2;
                Some((base, size))
            }
            AddressMatching::Na4 => Some((self.value << 2, PMP_GRANULE)),
            AddressMatching::Off | AddressMatching::Tor => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpCfg {
    pub index: usize,
    pub value: u64,
}

/// One pmpcfg register and the pmpaddr registers it configures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PmpRegisters {
    pub cfg: PmpCfg,
    pub addrs: Vec<PmpAddr>,
}

/// Builds protection entries and their register values.
#[derive(Clone, Debug)]
pub struct PmpRegion {
    pad_napot: bool,
    xlen: Xlen,
    entries: Vec<PmpEntry>,
}

impl Default for PmpRegion {
    fn default() -> Self {
        Self::new(true, Xlen::Rv64)
    }
}

impl PmpRegion {
    /// With `pad_napot` an unaligned region grows to one enclosing NAPOT
    /// entry; without it the region is split into aligned chunks.
    pub fn new(pad_napot: bool, xlen: Xlen) -> Self {
        Self { pad_napot, xlen, entries: Vec::new() }
    }

    pub fn entries(&self) -> &[PmpEntry] {
        &self.entries
    }

    pub fn is_napot(base: u64, size: u64) -> bool {
        size >= PMP_NAPOT_GRANULE && size.is_power_of_two() && base & (size - 1) == 0
    }

    fn napot_pad(base: u64, size: u64) -> Result<Vec<(u64, u64)>, PmpError> {
        let last = base.checked_add(size - 1).ok_or(PmpError::Unaligned { base, size })?;
        let bits = u64::BITS - last.leading_zeros();
        let cover = 1u64.checked_shl(bits).filter(|&c| c != 0).ok_or(PmpError::Unaligned { base, size })?;
        if cover < PMP_NAPOT_GRANULE {
            return Err(PmpError::NapotSize(cover));
        }
        Ok(vec![(base & !(cover - 1), cover)])
    }

    fn napot_cover(base: u64, size: u64) -> Result<Vec<(u64, u64)>, PmpError> {
        let mut out = Vec::new();
        let (mut addr, mut rem) = (base, size);
        while rem != 0 {
            let align = if addr == 0 { u64::MAX } else { 1u64 << addr.trailing_zeros() };
            let span = 1u64 << (u64::BITS - 1 - rem.leading_zeros());
            let chunk = span.min(align);
            if chunk < PMP_NAPOT_GRANULE {
                return Err(PmpError::Unaligned { base, size });
            }
            out.push((addr, chunk));
            addr = addr.wrapping_add(chunk);
            rem -= chunk;
        }
        Ok(out)
    }

    /// Appends `[base, base + size)`. Regions are not merged.
    pub fn add_region(&mut self, base: u64, size: u64, perms: PmpPerms) -> Result<&mut Self, PmpError> {
        if size == 0 {
            return Err(PmpError::NapotSize(0));
        }
        info!(target: "pmp", "region {:#x}+{:#x} {:?}", base, size, perms);
        let chunks = if Self::is_napot(base, size) {
            vec![(base, size)]
        } else if self.pad_napot {
            Self::napot_pad(base, size)?
        } else {
            Self::napot_cover(base, size)?
        };
        if self.entries.len() + chunks.len() > PMP_ENTRIES {
            return Err(PmpError::SlotsExhausted);
        }
        for (start, len) in chunks {
            debug!(target: "pmp", "napot {:#x}+{:#x}", start, len);
            self.entries.push(PmpEntry::napot(start, len, perms));
        }
        Ok(self)
    }

    /// Register values grouped per pmpcfg register. RV64 only uses even cfg indices.
    pub fn encode(&self) -> Result<Vec<PmpRegisters>, PmpError> {
        let per_reg = self.xlen.entries_per_cfg();
        let stride = match self.xlen {
            Xlen::Rv32 => 1,
            Xlen::Rv64 => 2,
        };
        let mut out = Vec::new();
        for (group, chunk) in self.entries.chunks(per_reg).enumerate() {
            let mut value = 0u64;
            let mut addrs = Vec::with_capacity(chunk.len());
            for (slot, entry) in chunk.iter().enumerate() {
                let index = group * per_reg + slot;
                value |= u64::from(entry.encode_cfg()) << (8 * slot);
                addrs.push(PmpAddr { index, value: entry.encode_addr()?, matching: entry.matching });
            }
            out.push(PmpRegisters { cfg: PmpCfg { index: group * stride, value }, addrs });
        }
        Ok(out)
    }
}
