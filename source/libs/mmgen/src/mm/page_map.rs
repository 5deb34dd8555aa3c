// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: One translation context (one stage, one mode) and its pages
//! OWNERS: @mmgen
//! PUBLIC API: PageMap::{new, initialize, add_page, add_pt_page, create_pagetables,
//!             translate, serialize, dump, listing}
//! DEPENDS_ON: mm::page_table::TableTree, addrgen::AddrGen
//! INVARIANTS: Pages are walked in registration order, then the secondary queue;
//!             the map's own root anchor is never walked in this map

use std::fmt;

use log::info;

use super::attrs::{entry_target, PteAttrs};
use super::page::{Page, PageArena, PageId};
use super::page_table::{TableId, TableTree, WalkCtx};
use super::PagingMode;
use crate::addrgen::AddrGen;
use crate::determinism::RandSource;
use crate::error::{Error, Result};
use crate::types::{Address, AddressConstraint, AddressKind, AddressTable, Qualifiers};

/// Root anchor of a VS or single-stage map: 16 KiB, 8 KiB aligned.
const ROOT_SIZE: u64 = 0x4000;
const ROOT_MASK: u64 = 0xFFFF_FFFF_FFFF_E000;
/// Root anchor of a G-stage map: 2 MiB, 2 MiB aligned.
const GSTAGE_ROOT_SIZE: u64 = 0x20_0000;
const GSTAGE_ROOT_MASK: u64 = 0xFFFF_FFFF_FFE0_0000;

/// Result of a software walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    pub pa: u64,
    pub level: usize,
    pub raw: u64,
    pub attrs: PteAttrs,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEntry {
    pub index: usize,
    /// Byte offset inside the table image.
    pub offset: u64,
    pub raw: u64,
    pub annotation: String,
}

/// One table frame ready for emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedTable {
    pub base: u64,
    pub level: usize,
    /// Dense little-endian image of the whole table.
    pub image: Vec<u8>,
    pub entries: Vec<SerializedEntry>,
}

#[derive(Clone, Debug)]
pub struct PageMap {
    name: String,
    primary: bool,
    tree: TableTree,
    pages: Vec<PageId>,
    pt_pages: Vec<PageId>,
}

impl PageMap {
    /// `primary` marks the shared map every other map's anchor lands in.
    pub fn new(name: impl Into<String>, mode: PagingMode, gstage: bool, primary: bool) -> Self {
        Self { name: name.into(), primary, tree: TableTree::new(mode, gstage), pages: Vec::new(), pt_pages: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PagingMode {
        self.tree.mode()
    }

    pub fn is_gstage(&self) -> bool {
        self.tree.is_gstage()
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn is_initialized(&self) -> bool {
        self.tree.root().is_some()
    }

    /// Physical address of the root table.
    pub fn root_base(&self) -> Option<u64> {
        self.tree.root().map(|id| self.tree.table(id).base)
    }

    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    pub fn pt_pages(&self) -> &[PageId] {
        &self.pt_pages
    }

    pub fn tree(&self) -> &TableTree {
        &self.tree
    }

    /// Allocates the root table and returns its anchor page, which the
    /// caller registers in the primary map. The anchor is identity mapped, so
    /// the root is placed where both address kinds are still free.
    /// `<name>_sptbr` is recorded in both address kinds.
    pub fn initialize(
        &mut self,
        addrgen: &mut AddrGen,
        rng: &mut dyn RandSource,
        addresses: &mut AddressTable,
        root_bits: u32,
    ) -> Result<Page> {
        let (size, mask) =
            if self.is_gstage() { (GSTAGE_ROOT_SIZE, GSTAGE_ROOT_MASK) } else { (ROOT_SIZE, ROOT_MASK) };
        let constraint = AddressConstraint::new(AddressKind::Physical, size)
            .with_mask(mask)
            .with_bits(root_bits)
            .with_qualifiers(Qualifiers::DRAM);
        let base = addrgen.generate_identity(&constraint, rng)?;
        self.tree.set_root(base);
        let anchor = Page::anchor(&self.name, base);
        addresses.insert(Address::new(anchor.name.clone(), AddressKind::Linear, base, size))?;
        addresses.insert(Address::new(anchor.name.clone(), AddressKind::Physical, base, size))?;
        info!(target: "pt", "{}: {} root at {:#x}", self.name, self.mode(), base);
        Ok(anchor)
    }

    /// Registers `id`. Private pages added to a non-primary map are copied so
    /// each map resolves its own instance.
    pub fn add_page(&mut self, id: PageId, arena: &mut PageArena) -> PageId {
        let id = if !self.primary && arena.get(id).private {
            let copy = arena.get(id).clone();
            arena.push(copy)
        } else {
            id
        };
        self.pages.push(id);
        id
    }

    /// Appends `id` to the secondary queue walked after the main pass.
    pub fn add_pt_page(&mut self, id: PageId) {
        self.pt_pages.push(id);
    }

    /// Builds tables for every registered page, then the secondary queue.
    pub fn create_pagetables(&mut self, arena: &mut PageArena, ctx: &mut WalkCtx<'_>) -> Result<()> {
        if self.mode() == PagingMode::Bare {
            return Ok(());
        }
        if !self.is_initialized() {
            return Err(Error::MapNotInitialized(self.name.clone()));
        }
        let main = self.pages.clone();
        for id in main {
            self.build_page(id, arena, ctx)?;
        }
        let mut next = 0;
        while next < self.pt_pages.len() {
            let id = self.pt_pages[next];
            self.build_page(id, arena, ctx)?;
            next += 1;
        }
        info!(
            target: "pt",
            "{}: {} pages, {} secondary, {} tables",
            self.name,
            self.pages.len(),
            self.pt_pages.len(),
            self.tree.len()
        );
        Ok(())
    }

    fn build_page(&mut self, id: PageId, arena: &mut PageArena, ctx: &mut WalkCtx<'_>) -> Result<()> {
        let page = arena.get(id);
        if page.is_anchor_of(&self.name) {
            return Ok(());
        }
        let outcome = self.tree.walk(&self.name, page, ctx)?;
        arena.get_mut(id).walk.extend(outcome.records);
        for pt_page in outcome.pt_pages {
            let pt_id = arena.push(pt_page);
            self.pt_pages.push(pt_id);
        }
        Ok(())
    }

    /// Walks `va` through this map's tables.
    pub fn translate(&self, va: u64) -> Option<Translation> {
        let (entry, level) = self.tree.lookup(va)?;
        let (_, lo) = self.mode().index_bits(level, self.is_gstage());
        let span = 1u64 << lo;
        Some(Translation {
            pa: (entry.target & !(span - 1)) | (va & (span - 1)),
            level,
            raw: entry.raw(self.mode()),
            attrs: entry.attrs,
        })
    }


    /// Tables in depth-first order from the root, entries in index order.
    pub fn serialize(&self) -> Vec<SerializedTable> {
        let Some(root) = self.tree.root() else {
            return Vec::new();
        };
        let mode = self.mode();
        let entry_size = mode.entry_size();
        let mut out = Vec::new();
        let mut stack: Vec<TableId> = vec![root];
        while let Some(id) = stack.pop() {
            let table = self.tree.table(id);
            let rows = mode.table_entries(table.level, self.is_gstage());
            let mut image = vec![0u8; rows * entry_size as usize];
            let mut entries = Vec::with_capacity(table.entries.len());
            for (&index, entry) in &table.entries {
                let raw = entry.raw(mode);
                let offset = index as u64 * entry_size;
                let at = offset as usize;
                let width = entry_size as usize;
                image[at..at + width].copy_from_slice(&raw.to_le_bytes()[..width]);
                let kind = if entry.is_leaf() { "leaf" } else { "table" };
                let annotation = format!(
                    "L{} [{:#05x}] {:#018x} {} {} -> {:#x} ({})",
                    entry.level,
                    index,
                    raw,
                    entry.attrs,
                    kind,
                    entry_target(raw),
                    entry.owner
                );
                entries.push(SerializedEntry { index, offset, raw, annotation });
            }
            for entry in table.entries.values().rev() {
                if let Some(next) = entry.next {
                    stack.push(next);
                }
            }
            out.push(SerializedTable { base: table.base, level: table.level, image, entries });
        }
        out
    }

    /// Human readable listing of every table and of each page's walk.
    pub fn dump(&self, arena: &PageArena) -> String {
        self.listing(arena).to_string()
    }

    /// Displays the tables and the walks of every page in this map.
    pub fn listing<'a>(&'a self, arena: &'a PageArena) -> MapListing<'a> {
        MapListing { map: self, arena }
    }
}

/// Text form of a [`PageMap`] with the pages it holds.
pub struct MapListing<'a> {
    map: &'a PageMap,
    arena: &'a PageArena,
}

impl fmt::Display for MapListing<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.map;
        writeln!(f, "# {} ({}{})", map.name, map.mode(), if map.is_gstage() { ", g-stage" } else { "" })?;
        for table in map.serialize() {
            writeln!(f, "table {:#x} L{}", table.base, table.level)?;
            for entry in &table.entries {
                writeln!(f, "  {}", entry.annotation)?;
            }
        }
        for &id in map.pages.iter().chain(map.pt_pages.iter()) {
            let page = self.arena.get(id);
            writeln!(f, "page {}", page.name)?;
            for record in page.walk().iter().filter(|r| r.map == map.name) {
                writeln!(f, "  {record}")?;
            }
        }
        Ok(())
    }
}
