// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for whole generation runs and PMA folding
//! OWNERS: @mmgen
//! NOTE: Tests only; drives GenContext with random page mixes.
//!
//! TEST_SCOPE:
//!   - Fixed and generated pages of every granule translate after a run,
//!     with and without a G stage
//!   - Map roots never take linear space a fixed page was declared at
//!   - PMA consolidation keeps every input covered with its own attributes
//!
//! TEST_SCENARIOS:
//!   - mixed_pages_translate(): random 4K/2M/1G pages, some pinned, single stage
//!   - mixed_pages_translate_through_g_stage(): same mix, VS and G both Sv39
//!   - consolidation_covers_inputs(): disjoint random descriptors fold soundly

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::config::GenConfig;
use crate::context::{GenContext, GenOutput, PageRequest, PRIMARY_MAP};
use crate::memory::{MemRange, Memory};
use crate::mm::{PageSize, PagingMode};
use crate::pma::{MemoryType, PmaInfo, PmaRegion, Routing};

const GIB: u64 = 0x4000_0000;
/// Physical home of pinned pages, one GiB per slot.
const FIXED_PHYS: u64 = 0x2_0000_0000;

fn arb_size() -> impl Strategy<Value = PageSize> {
    prop_oneof![4 => Just(PageSize::Size4K), 2 => Just(PageSize::Size2M), 1 => Just(PageSize::Size1G)]
}

/// Pinned pages keyed by their GiB slot. Slot 3 stays free so roots below
/// 4 GiB always find identity room; slot 2 overlaps DRAM on purpose.
fn arb_fixed() -> impl Strategy<Value = BTreeMap<u64, (PageSize, u64)>> {
    prop::collection::btree_map(prop::sample::select(vec![0u64, 1, 2, 4, 5, 6, 7]), (arb_size(), any::<u64>()), 0..4)
}

fn arb_generated() -> impl Strategy<Value = Vec<PageSize>> {
    prop::collection::vec(arb_size(), 0..10)
}

fn config(seed: u64, nested: bool) -> GenConfig {
    GenConfig {
        seed,
        paging_mode: PagingMode::Sv39,
        paging_g_mode: if nested { PagingMode::Sv39 } else { PagingMode::Bare },
        memory: Memory { dram: vec![MemRange::new(0x8000_0000, 0x4_0000_0000)], ..Memory::default() },
        ..GenConfig::default()
    }
}

fn run_mix(
    seed: u64,
    nested: bool,
    fixed: &BTreeMap<u64, (PageSize, u64)>,
    generated: &[PageSize],
) -> (GenOutput, Vec<String>) {
    let mut gen = GenContext::new(config(seed, nested)).expect("context");
    let mut names = Vec::new();
    for (&slot, &(size, pick)) in fixed {
        let offset = (pick % (GIB / size.bytes())) * size.bytes();
        let name = format!("pinned{slot}");
        let request = PageRequest::new(name.clone(), size)
            .at_lin(slot * GIB + offset)
            .at_phys(FIXED_PHYS + slot * GIB + offset);
        gen.declare(request).expect("declare");
        names.push(name);
    }
    for (i, &size) in generated.iter().enumerate() {
        let name = format!("free{i}");
        gen.declare(PageRequest::new(name.clone(), size)).expect("declare");
        names.push(name);
    }
    (gen.run().expect("run"), names)
}

fn check_translations(out: &GenOutput, names: &[String], offset: u64) -> Result<(), TestCaseError> {
    for name in names {
        let page = out.page(name).expect("page");
        let (lin, phys) = (page.lin_addr.expect("lin"), page.phys_addr.expect("phys"));
        let off = offset % page.size.bytes();
        prop_assert_eq!(out.translate(PRIMARY_MAP, lin + off), Some(phys + off), "{} {}", name, page.size);
    }
    Ok(())
}

fn arb_pma() -> impl Strategy<Value = BTreeMap<u64, (u64, bool, bool, bool)>> {
    // slot -> (pages, io, readable, coherent); slots are 64 KiB apart so inputs never overlap
    prop::collection::btree_map(0u64..48, (1u64..=16, any::<bool>(), any::<bool>(), any::<bool>()), 1..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn mixed_pages_translate(seed in any::<u64>(), fixed in arb_fixed(), generated in arb_generated(), offset in any::<u64>()) {
        let (out, names) = run_mix(seed, false, &fixed, &generated);
        check_translations(&out, &names, offset)?;
    }

    #[test]
    fn mixed_pages_translate_through_g_stage(seed in any::<u64>(), fixed in arb_fixed(), generated in arb_generated(), offset in any::<u64>()) {
        let (out, names) = run_mix(seed, true, &fixed, &generated);
        check_translations(&out, &names, offset)?;
    }

    #[test]
    fn consolidation_covers_inputs(entries in arb_pma()) {
        let mut pma = PmaRegion::new();
        for (&slot, &(pages, io, read, coherent)) in entries.iter().rev() {
            let kind = if io { MemoryType::Io } else { MemoryType::Memory };
            let info = pma.add_region(slot * 0x1_0000, pages * 0x1000, kind);
            info.read = read;
            info.routing = if coherent { Routing::Coherent } else { Routing::NonCoherent };
        }
        let inputs: Vec<PmaInfo> = pma.entries().to_vec();
        let out = pma.consolidated_entries();

        for pair in out.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].address, "{} overlaps {}", pair[0], pair[1]);
        }
        for input in &inputs {
            prop_assert!(
                out.iter().any(|o| o.contains(input) && o.attrs_match(input)),
                "{} lost", input
            );
        }
        let memory = |list: &[PmaInfo]| -> u64 {
            list.iter().filter(|e| e.memory_type == MemoryType::Memory).map(|e| e.size).sum()
        };
        prop_assert_eq!(memory(&out), memory(&inputs));
    }
}
