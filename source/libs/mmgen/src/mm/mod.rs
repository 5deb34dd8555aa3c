// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V paging modes, page granules and the per-level index layout.

pub mod attrs;
pub mod page;
pub mod page_map;
pub mod page_table;

#[cfg(test)]
mod tests_prop;

use std::fmt;

use serde::Deserialize;
use static_assertions::const_assert;

pub use attrs::{Attr, AttrTable, PteAttrs, PteFlags};
pub use page::{Page, PageArena, PageId};
pub use page_map::{MapListing, PageMap, SerializedEntry, SerializedTable, Translation};
pub use page_table::{NestedSink, PtEntry, PtTable, ShadowFrame, TableId};

/// Smallest translation granule.
pub const PAGE_SIZE: u64 = 0x1000;
/// Deepest table hierarchy of any supported mode (Sv57).
pub const MAX_LEVELS: usize = 5;
/// Bit set on table frames and leaf targets tagged secure.
pub const SECURE_ADDR_BIT: u64 = 1 << 55;
/// Mask of the 44-bit PPN field, before shifting into place.
pub const PPN_MASK: u64 = (1 << 44) - 1;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(SECURE_ADDR_BIT >> 12 <= PPN_MASK);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagingMode {
    #[default]
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

impl PagingMode {
    /// Number of table levels walked.
    pub const fn levels(self) -> usize {
        match self {
            Self::Bare => 0,
            Self::Sv32 => 2,
            Self::Sv39 => 3,
            Self::Sv48 => 4,
            Self::Sv57 => 5,
        }
    }

    /// Width of a translated address. A nested G-stage root adds two bits.
    pub const fn va_bits(self, nested: bool) -> u32 {
        let base = match self {
            Self::Bare => 52,
            Self::Sv32 => 32,
            Self::Sv39 => 39,
            Self::Sv48 => 48,
            Self::Sv57 => 57,
        };
        if nested && !matches!(self, Self::Bare) {
            base + 2
        } else {
            base
        }
    }

    /// Widest physical address a table entry of this mode can hold.
    pub const fn max_pa_bits(self) -> u32 {
        match self {
            Self::Sv32 => 34,
            _ => 56,
        }
    }

    /// Bytes per table entry.
    pub const fn entry_size(self) -> u64 {
        match self {
            Self::Sv32 => 4,
            _ => 8,
        }
    }

    /// Bits an entry of this mode can hold.
    pub const fn entry_mask(self) -> u64 {
        match self {
            Self::Sv32 => u32::MAX as u64,
            _ => u64::MAX,
        }
    }

    /// Inclusive `(hi, lo)` bits of the index for `level`.
    pub const fn index_bits(self, level: usize, nested: bool) -> (u32, u32) {
        let (hi, lo) = match self {
            Self::Sv32 => {
                if level == 0 {
                    (21, 12)
                } else {
                    (31, 22)
                }
            }
            _ => {
                let lo = 12 + 9 * level as u32;
                (lo + 8, lo)
            }
        };
        if nested && level + 1 == self.levels() {
            (hi + 2, lo)
        } else {
            (hi, lo)
        }
    }

    /// Row index of `va` in the table at `level`.
    pub const fn vpn_index(self, va: u64, level: usize, nested: bool) -> usize {
        let (hi, lo) = self.index_bits(level, nested);
        ((va >> lo) & ((1u64 << (hi - lo + 1)) - 1)) as usize
    }

    /// Rows in the table at `level`.
    pub const fn table_entries(self, level: usize, nested: bool) -> usize {
        let (hi, lo) = self.index_bits(level, nested);
        1 << (hi - lo + 1)
    }

    pub const fn supports(self, size: PageSize) -> bool {
        let leaf = size.leaf_level();
        match (self, size) {
            (Self::Bare, _) => false,
            (Self::Sv32, PageSize::Size4K | PageSize::Size4M) => true,
            (Self::Sv32, _) | (_, PageSize::Size4M) => false,
            _ => leaf < self.levels(),
        }
    }
}

impl fmt::Display for PagingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bare => "bare",
            Self::Sv32 => "sv32",
            Self::Sv39 => "sv39",
            Self::Sv48 => "sv48",
            Self::Sv57 => "sv57",
        };
        f.write_str(name)
    }
}

/// Translation granule of a leaf mapping.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageSize {
    #[default]
    Size4K,
    /// Sv32 megapage.
    Size4M,
    Size2M,
    Size1G,
    Size512G,
    Size256T,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 0x1000,
            Self::Size4M => 0x40_0000,
            Self::Size2M => 0x20_0000,
            Self::Size1G => 0x4000_0000,
            Self::Size512G => 0x80_0000_0000,
            Self::Size256T => 0x1_0000_0000_0000,
        }
    }

    /// Table level the leaf entry lives in.
    pub const fn leaf_level(self) -> usize {
        match self {
            Self::Size4K => 0,
            Self::Size4M | Self::Size2M => 1,
            Self::Size1G => 2,
            Self::Size512G => 3,
            Self::Size256T => 4,
        }
    }

    /// Alignment mask for addresses of this granule.
    pub const fn mask(self) -> u64 {
        !(self.bytes() - 1)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Size4K => "4KiB",
            Self::Size4M => "4MiB",
            Self::Size2M => "2MiB",
            Self::Size1G => "1GiB",
            Self::Size512G => "512GiB",
            Self::Size256T => "256TiB",
        };
        f.write_str(name)
    }
}
