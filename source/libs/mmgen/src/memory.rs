// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical memory map handed to the allocator and the PMA/PMP seeding.

use serde::Deserialize;

pub const DEFAULT_DRAM_START: u64 = 0x8000_0000;
pub const DEFAULT_DRAM_SIZE: u64 = 1 << 56;

/// One `[start, start + size)` window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemRange {
    pub start: u64,
    pub size: u64,
}

impl MemRange {
    pub const fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    /// Inclusive last byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size.saturating_sub(1))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Memory {
    pub dram: Vec<MemRange>,
    pub io: Vec<MemRange>,
    pub secure: Vec<MemRange>,
    pub reserved: Vec<MemRange>,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            dram: vec![MemRange::new(DEFAULT_DRAM_START, DEFAULT_DRAM_SIZE)],
            io: vec![MemRange::new(0, DEFAULT_DRAM_START)],
            secure: Vec::new(),
            reserved: Vec::new(),
        }
    }
}
