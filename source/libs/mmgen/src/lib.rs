// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address allocation and RISC-V page-table synthesis for test generation
//! INTENT: Place linear/physical addresses without collision, build Sv32..Sv57 tables
//!         (optionally two-stage VS/G), classify PMA ranges and encode PMP registers
//! DEPS: bitflags, log, rand, serde, static_assertions, thiserror, toml
//! READINESS: Library; single-shot per generated test
//! TESTS: Unit tests per module; proptest for allocator and walks; tests/generation.rs

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]

pub mod addrgen;
pub mod config;
pub mod context;
pub mod determinism;
pub mod error;
pub mod memory;
pub mod mm;
pub mod pma;
pub mod pmp;
pub mod types;

#[cfg(test)]
mod tests_prop;

pub use config::{AddrFilterConfig, GenConfig, PrivMode};
pub use context::{GenContext, GenOutput, PageRequest};
pub use determinism::{RandSource, SeededRng};
pub use error::{Error, Result};
pub use mm::{PageSize, PagingMode};
pub use types::{Address, AddressConstraint, AddressKind, AddressTable, Qualifiers};
