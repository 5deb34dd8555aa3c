// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::mm::{PageSize, PagingMode};
use crate::pmp::PmpError;
use crate::types::{AddressConstraint, AddressKind, Qualifiers};

pub type Result<T> = core::result::Result<T, Error>;

/// Failures surfaced by a generation run. All of them are fatal to the run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no address region satisfies {constraint}")]
    AddressExhausted { constraint: AddressConstraint },
    #[error("invalid address constraint: {0}")]
    InvalidConstraint(&'static str),
    #[error("qualifier {qualifier:?} is not defined in the {kind} address space")]
    UndefinedQualifier { qualifier: Qualifiers, kind: AddressKind },
    #[error("page map `{0}` used before initialize()")]
    MapNotInitialized(String),
    #[error("unknown page map `{0}`")]
    UnknownMap(String),
    #[error("page map `{0}` already exists")]
    DuplicateMap(String),
    #[error("page size {size} has no leaf level in {mode}")]
    UnsupportedPageSize { size: PageSize, mode: PagingMode },
    #[error("address name `{0}` already defined")]
    DuplicateAddress(String),
    #[error("page `{name}` has no {kind} address")]
    UnresolvedAddress { name: String, kind: AddressKind },
    #[error("PMA size {0:#x} is not a power of two")]
    PmaSizeNotPowerOfTwo(u64),
    #[error("PMA size {0:#x} does not fit the size code")]
    PmaSizeOutOfRange(u64),
    #[error(transparent)]
    Pmp(#[from] PmpError),
    #[error("failed to parse config: {0}")]
    Config(#[from] toml::de::Error),
}
