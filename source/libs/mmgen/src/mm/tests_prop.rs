// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for table construction
//! OWNERS: @mmgen
//! NOTE: Tests only; exercises the walk through random 4 KiB page sets.
//!
//! TEST_SCOPE:
//!   - Every built leaf translates back to the page's physical address
//!   - Table images stay consistent with the entries they carry
//!   - Builds are reproducible from the seed
//!
//! TEST_SCENARIOS:
//!   - translate_round_trips(): lin + offset resolves to phys + offset in every mode
//!   - images_match_entries(): each serialized entry is found at its offset
//!   - same_seed_same_tables(): two builds with one seed serialize identically

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::attrs::AttrPolicy;
use super::page_table::{FramePolicy, WalkCtx};
use super::*;
use crate::addrgen::AddrGen;
use crate::determinism::SeededRng;
use crate::memory::Memory;
use crate::types::{AddressKind, AddressTable};

fn arb_mode() -> impl Strategy<Value = PagingMode> {
    prop_oneof![Just(PagingMode::Sv32), Just(PagingMode::Sv39), Just(PagingMode::Sv48), Just(PagingMode::Sv57)]
}

/// Distinct 4 KiB virtual page numbers below 2^31 so every mode can hold them.
fn arb_vpns() -> impl Strategy<Value = BTreeSet<u64>> {
    prop::collection::btree_set(0u64..(1 << 19), 1..24)
}

struct Built {
    map: PageMap,
    pages: Vec<(u64, u64)>,
}

fn build(mode: PagingMode, vpns: &BTreeSet<u64>, seed: u64) -> Built {
    let mut addrgen = AddrGen::new(&Memory::default());
    let mut rng = SeededRng::new(seed);
    let mut addresses = AddressTable::default();
    let mut arena = PageArena::new();
    let mut map = PageMap::new("map_os", mode, false, true);
    map.initialize(&mut addrgen, &mut rng, &mut addresses, 32).expect("root");

    let mut pages = Vec::new();
    for (i, vpn) in vpns.iter().enumerate() {
        let lin = vpn << 12;
        let phys = 0x8000_0000 + ((i as u64 + 64) << 12);
        addrgen.reserve(AddressKind::Physical, phys, PAGE_SIZE).expect("reserve");
        let id = arena.push(Page::new(format!("p{i}"), PageSize::Size4K).with_lin(lin).with_phys(phys));
        map.add_page(id, &mut arena);
        pages.push((lin, phys));
    }
    let mut ctx = WalkCtx {
        addrgen: &mut addrgen,
        rng: &mut rng,
        addresses: &mut addresses,
        policy: AttrPolicy { ad_probability: 50, secure_probability: 30, ..AttrPolicy::default() },
        frames: FramePolicy { phys_bits: 52, secure_mode: false, secure_probability: 0 },
        nested: None,
    };
    map.create_pagetables(&mut arena, &mut ctx).expect("build");
    Built { map, pages }
}

proptest! {
    #[test]
    fn translate_round_trips(mode in arb_mode(), vpns in arb_vpns(), offset in 0u64..PAGE_SIZE, seed in any::<u64>()) {
        let built = build(mode, &vpns, seed);
        for &(lin, phys) in &built.pages {
            let t = built.map.translate(lin + offset);
            prop_assert_eq!(t.map(|t| t.pa), Some(phys + offset));
            prop_assert_eq!(t.map(|t| t.level), Some(0));
        }
    }

    #[test]
    fn images_match_entries(mode in arb_mode(), vpns in arb_vpns()) {
        let built = build(mode, &vpns, 3);
        let width = mode.entry_size() as usize;
        let tables = built.map.serialize();
        prop_assert_eq!(tables.len(), built.map.tree().len());
        for table in &tables {
            for entry in &table.entries {
                let at = entry.offset as usize;
                let mut bytes = [0u8; 8];
                bytes[..width].copy_from_slice(&table.image[at..at + width]);
                prop_assert_eq!(u64::from_le_bytes(bytes), entry.raw);
            }
        }
    }

    #[test]
    fn same_seed_same_tables(vpns in arb_vpns(), seed in any::<u64>()) {
        let a = build(PagingMode::Sv39, &vpns, seed);
        let b = build(PagingMode::Sv39, &vpns, seed);
        prop_assert_eq!(a.map.serialize(), b.map.serialize());
    }
}
