// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Generation knobs for one run, loadable from TOML
//! OWNERS: @mmgen
//! PUBLIC API: GenConfig, PrivMode, AddrFilterConfig
//! DEPENDS_ON: serde, toml
//! INVARIANTS: Unknown keys are rejected; every field has a default

use serde::Deserialize;

use crate::determinism::DEFAULT_SEED;
use crate::error::Result;
use crate::memory::Memory;
use crate::mm::PagingMode;

/// Privilege mode the generated code runs in.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivMode {
    Machine,
    #[default]
    Supervisor,
    User,
}

/// Optional predicate applied to linear address candidates.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AddrFilterConfig {
    /// At most `max` linear addresses may share the index bits `[hi:lo]`.
    IndexWindow {
        #[serde(default = "default_index_lo")]
        lo: u32,
        #[serde(default = "default_index_hi")]
        hi: u32,
        #[serde(default = "default_index_max")]
        max: u32,
    },
    /// Reject candidates hashing to way-predictor slot 0.
    WayPredictor,
}

fn default_index_lo() -> u32 {
    6
}

fn default_index_hi() -> u32 {
    15
}

fn default_index_max() -> u32 {
    4
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenConfig {
    pub seed: u64,
    pub paging_mode: PagingMode,
    pub paging_g_mode: PagingMode,
    pub priv_mode: PrivMode,
    /// Hardware-managed A/D bits: leaf A/D become random instead of 1.
    pub svadu: bool,
    pub ad_probability: u32,
    pub secure_mode: bool,
    pub secure_pt_probability: u32,
    pub secure_access_probability: u32,
    pub pbmt_ncio: bool,
    pub physical_addr_bits: u32,
    pub root_table_addr_bits: u32,
    pub addr_filter: Option<AddrFilterConfig>,
    pub memory: Memory,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            paging_mode: PagingMode::Sv39,
            paging_g_mode: PagingMode::Bare,
            priv_mode: PrivMode::Supervisor,
            svadu: false,
            ad_probability: 50,
            secure_mode: false,
            secure_pt_probability: 0,
            secure_access_probability: 30,
            pbmt_ncio: false,
            physical_addr_bits: 52,
            root_table_addr_bits: 32,
            addr_filter: None,
            memory: Memory::default(),
        }
    }
}

impl GenConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        Ok(toml::from_str(data)?)
    }

    /// Two-stage translation is active when the G stage has a paging mode.
    #[inline]
    pub fn nested(&self) -> bool {
        self.paging_g_mode != PagingMode::Bare
    }
}
