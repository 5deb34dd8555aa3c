// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page-table tree of one map and the walk that populates it.
//!
//! Tables live in an arena indexed by [`TableId`]. A walk descends from the
//! root, reusing non-leaf entries, allocating frames for missing tables and
//! finally writing the leaf. A leaf met on the way down ends the walk for
//! that page and leaves the existing entry untouched.

use std::collections::BTreeMap;

use log::{debug, warn};

use super::attrs::{Attr, AttrPolicy, AttrTable, PteAttrs};
use super::page::{Page, WalkRecord};
use super::{PageSize, PagingMode, PAGE_SIZE, SECURE_ADDR_BIT};
use crate::addrgen::AddrGen;
use crate::determinism::RandSource;
use crate::error::{Error, Result};
use crate::types::{Address, AddressConstraint, AddressKind, AddressTable, Qualifiers};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(usize);

/// One populated slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtEntry {
    pub level: usize,
    /// Next-level table, `None` for a leaf.
    pub next: Option<TableId>,
    /// Address encoded into the PPN field.
    pub target: u64,
    pub attrs: PteAttrs,
    /// Page that wrote the entry.
    pub owner: String,
}

impl PtEntry {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.next.is_none()
    }

    /// Encoded entry, cut to the entry width of `mode`.
    #[inline]
    pub fn raw(&self, mode: PagingMode) -> u64 {
        self.attrs.encode(self.target) & mode.entry_mask()
    }
}

/// Sparse table: row index to entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtTable {
    pub base: u64,
    pub level: usize,
    pub entries: BTreeMap<usize, PtEntry>,
}

/// Frame mirrored into the G-stage map as a GPA to HPA identity mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowFrame {
    pub name: String,
    pub gpa: u64,
    pub size: PageSize,
    /// VS level that introduced the frame.
    pub vs_level: usize,
    pub leaf: bool,
    pub attrs: AttrTable,
}

/// Receives frames introduced by a VS-stage walk.
pub trait NestedSink {
    fn mirror(&mut self, frame: ShadowFrame);
}

impl NestedSink for Vec<ShadowFrame> {
    fn mirror(&mut self, frame: ShadowFrame) {
        self.push(frame);
    }
}

/// Frame allocation knobs for new tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePolicy {
    pub phys_bits: u32,
    pub secure_mode: bool,
    pub secure_probability: u32,
}

/// Collaborators of a walk, borrowed from the owning context.
pub struct WalkCtx<'a> {
    pub addrgen: &'a mut AddrGen,
    pub rng: &'a mut dyn RandSource,
    pub addresses: &'a mut AddressTable,
    pub policy: AttrPolicy,
    pub frames: FramePolicy,
    /// Present when this map's frames must be mirrored into a G-stage map.
    pub nested: Option<&'a mut dyn NestedSink>,
}

/// Result of walking one page.
#[derive(Debug, Default)]
pub struct WalkOutcome {
    pub records: Vec<WalkRecord>,
    /// Pages exposing the tables this walk wrote into.
    pub pt_pages: Vec<Page>,
    pub abandoned: bool,
}

/// Position of one entry.
#[derive(Clone, Copy, Debug)]
struct Slot {
    level: usize,
    table_base: u64,
    index: usize,
}

#[derive(Clone, Debug)]
pub struct TableTree {
    mode: PagingMode,
    gstage: bool,
    tables: Vec<PtTable>,
    root: Option<TableId>,
}

impl TableTree {
    pub fn new(mode: PagingMode, gstage: bool) -> Self {
        Self { mode, gstage, tables: Vec::new(), root: None }
    }

    #[inline]
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    #[inline]
    pub fn is_gstage(&self) -> bool {
        self.gstage
    }

    pub fn root(&self) -> Option<TableId> {
        self.root
    }

    pub fn table(&self, id: TableId) -> &PtTable {
        &self.tables[id.0]
    }

    pub fn tables(&self) -> impl Iterator<Item = (TableId, &PtTable)> {
        self.tables.iter().enumerate().map(|(i, t)| (TableId(i), t))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Installs the root table at `base`.
    pub fn set_root(&mut self, base: u64) -> TableId {
        let top = self.mode.levels().saturating_sub(1);
        let id = self.push_table(base, top);
        self.root = Some(id);
        id
    }

    fn push_table(&mut self, base: u64, level: usize) -> TableId {
        self.tables.push(PtTable { base, level, entries: BTreeMap::new() });
        TableId(self.tables.len() - 1)
    }

    /// Allocates a frame for a new table below a VS or G entry.
    fn alloc_frame(&self, page: &Page, ctx: &mut WalkCtx<'_>) -> Result<u64> {
        let granule = match (&ctx.nested, page.g_nonleaf_size) {
            (Some(_), Some(size)) => size,
            _ => PageSize::Size4K,
        };
        let secure = ctx.frames.secure_mode && ctx.rng.with_probability_of(ctx.frames.secure_probability);
        let qualifiers = if secure { Qualifiers::SECURE } else { Qualifiers::DRAM };
        let constraint = AddressConstraint::new(AddressKind::Physical, granule.bytes())
            .with_mask(granule.mask())
            .with_bits(ctx.frames.phys_bits.min(self.mode.max_pa_bits()))
            .with_qualifiers(qualifiers);
        let base = ctx.addrgen.generate(&constraint, ctx.rng)?;
        Ok(if secure { base | SECURE_ADDR_BIT } else { base })
    }

    /// Queues a page mapping a fresh linear address onto `slot`.
    fn expose_table(
        &self,
        map: &str,
        page: &Page,
        slot: Slot,
        ctx: &mut WalkCtx<'_>,
        out: &mut WalkOutcome,
    ) -> Result<()> {
        let Slot { level, table_base, index } = slot;
        let constraint = AddressConstraint::new(AddressKind::Linear, PAGE_SIZE).with_bits(self.mode.va_bits(false) - 1);
        let offset = index as u64 * self.mode.entry_size();
        let lin = ctx.addrgen.generate(&constraint, ctx.rng)? + offset;
        let phys = table_base + offset;
        let name = format!("{}__pt_level{}", page.name, level);
        let mut pt_page = Page::new(name.clone(), PageSize::Size4K).with_lin(lin).with_phys(phys).in_map(map);
        pt_page.no_pbmt_ncio = true;
        ctx.addresses.insert_if_absent(Address::new(name, AddressKind::Linear, lin, PAGE_SIZE));
        ctx.addresses.insert_if_absent(Address::new(pt_page.phys_name.clone(), AddressKind::Physical, phys, PAGE_SIZE));
        debug!(target: "pt", "{}: exposing L{} table {:#x}[{:#x}] at {:#x}", page.name, level, table_base, index, lin);
        out.pt_pages.push(pt_page);
        Ok(())
    }

    /// Walks `page` from the root to its leaf level.
    pub(crate) fn walk(&mut self, map: &str, page: &Page, ctx: &mut WalkCtx<'_>) -> Result<WalkOutcome> {
        let root = self.root.ok_or_else(|| Error::MapNotInitialized(map.to_owned()))?;
        if !self.mode.supports(page.size) {
            return Err(Error::UnsupportedPageSize { size: page.size, mode: self.mode });
        }
        let lin = page
            .lin_addr
            .ok_or_else(|| Error::UnresolvedAddress { name: page.name.clone(), kind: AddressKind::Linear })?;
        let phys = page
            .phys_addr
            .ok_or_else(|| Error::UnresolvedAddress { name: page.name.clone(), kind: AddressKind::Physical })?;

        let leaf_level = page.size.leaf_level();
        let modify_pt = page.attrs.is_set(Attr::ModifyPt) && !self.gstage;
        let mirror = ctx.nested.is_some() && !self.gstage;
        let mut out = WalkOutcome::default();
        let mut table = root;

        for level in (leaf_level + 1..self.mode.levels()).rev() {
            let index = self.mode.vpn_index(lin, level, self.gstage);
            let table_base = self.tables[table.0].base;
            if let Some(entry) = self.tables[table.0].entries.get(&index) {
                match entry.next {
                    None => {
                        warn!(
                            target: "pt",
                            "{}: {} at {:#x} meets leaf of `{}` at L{} index {:#x}, skipping",
                            map, page.name, lin, entry.owner, level, index
                        );
                        out.abandoned = true;
                        return Ok(out);
                    }
                    Some(next) => {
                        out.records.push(WalkRecord {
                            map: map.to_owned(),
                            level,
                            table_base,
                            index,
                            raw: entry.raw(self.mode),
                            leaf: false,
                            reused: true,
                        });
                        table = next;
                        continue;
                    }
                }
            }

            let attrs = ctx.policy.resolve(&page.attrs, level, false, self.gstage, !page.no_pbmt_ncio, &mut *ctx.rng);
            let frame = self.alloc_frame(page, ctx)?;
            let next = self.push_table(frame, level - 1);
            let entry = PtEntry { level, next: Some(next), target: frame, attrs, owner: page.name.clone() };
            let raw = entry.raw(self.mode);
            self.tables[table.0].entries.insert(index, entry);
            debug!(target: "pt", "{}: {} L{} [{:#x}] -> table {:#x}", map, page.name, level, index, frame);
            out.records.push(WalkRecord {
                map: map.to_owned(),
                level,
                table_base,
                index,
                raw,
                leaf: false,
                reused: false,
            });

            if mirror {
                let size = page.g_nonleaf_size.unwrap_or(PageSize::Size4K);
                if let Some(sink) = ctx.nested.as_mut() {
                    sink.mirror(ShadowFrame {
                        name: format!("{}__vslevel{}__gpa", page.name, level),
                        gpa: frame,
                        size,
                        vs_level: level,
                        leaf: false,
                        attrs: page.attrs.shadow_for(level),
                    });
                }
            }
            if modify_pt {
                self.expose_table(map, page, Slot { level, table_base, index }, ctx, &mut out)?;
            }
            table = next;
        }

        let index = self.mode.vpn_index(lin, leaf_level, self.gstage);
        let table_base = self.tables[table.0].base;
        if let Some(existing) = self.tables[table.0].entries.get(&index) {
            if !existing.is_leaf() {
                warn!(
                    target: "pt",
                    "{}: {} leaf at L{} index {:#x} would replace table of `{}`, skipping",
                    map, page.name, leaf_level, index, existing.owner
                );
                out.abandoned = true;
                return Ok(out);
            }
            debug!(target: "pt", "{}: {} replaces leaf of `{}`", map, page.name, existing.owner);
        }

        let attrs = ctx.policy.resolve(&page.attrs, leaf_level, true, self.gstage, !page.no_pbmt_ncio, &mut *ctx.rng);
        let target = if attrs.secure { phys | SECURE_ADDR_BIT } else { phys };
        let entry = PtEntry { level: leaf_level, next: None, target, attrs, owner: page.name.clone() };
        let raw = entry.raw(self.mode);
        self.tables[table.0].entries.insert(index, entry);
        debug!(target: "pt", "{}: {} L{} [{:#x}] leaf {:#x} -> {:#x}", map, page.name, leaf_level, index, lin, target);
        out.records.push(WalkRecord {
            map: map.to_owned(),
            level: leaf_level,
            table_base,
            index,
            raw,
            leaf: true,
            reused: false,
        });

        if mirror {
            if let Some(sink) = ctx.nested.as_mut() {
                sink.mirror(ShadowFrame {
                    name: format!("{}__vsleaf{}__gpa", page.name, leaf_level),
                    gpa: phys,
                    size: page.g_leaf_size.unwrap_or(page.size),
                    vs_level: leaf_level,
                    leaf: true,
                    attrs: page.attrs.shadow_for(leaf_level),
                });
            }
        }
        if modify_pt {
            self.expose_table(map, page, Slot { level: leaf_level, table_base, index }, ctx, &mut out)?;
        }
        Ok(out)
    }

    /// Software walk of `va`.
    pub fn lookup(&self, va: u64) -> Option<(&PtEntry, usize)> {
        let mut table = self.root?;
        for level in (0..self.mode.levels()).rev() {
            let index = self.mode.vpn_index(va, level, self.gstage);
            let entry = self.tables[table.0].entries.get(&index)?;
            match entry.next {
                None => return Some((entry, level)),
                Some(next) => table = next,
            }
        }
        None
    }
}
