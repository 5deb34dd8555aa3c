// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Owned state of one generation run and the run sequence
//! OWNERS: @mmgen
//! PUBLIC API: GenContext::{new, add_map, reserve, generate, declare, add_pma_region, run},
//!             PageRequest, GenOutput
//! DEPENDS_ON: addrgen, mm, pma, pmp, determinism
//! INVARIANTS: Fixed addresses are reserved before anything is generated;
//!             maps are built in creation order, the G-stage map last;
//!             one seed and one declaration order give one output
//!
//! Run order:
//!   1. reserve fixed page addresses
//!   2. initialize maps (primary, G stage, user maps) and register root anchors
//!   3. resolve missing addresses in declaration order
//!   4. register pages into their maps
//!   5. build single-stage and VS maps, collecting shadow frames
//!   6. queue shadow frames on the G map and build it
//!   7. serialize tables, consolidate PMA, encode PMP

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, info};

use crate::addrgen::AddrGen;
use crate::config::GenConfig;
use crate::determinism::SeededRng;
use crate::error::{Error, Result};
use crate::mm::attrs::AttrPolicy;
use crate::mm::page_table::{FramePolicy, NestedSink, WalkCtx};
use crate::mm::{
    AttrTable, Page, PageArena, PageId, PageMap, PageSize, PagingMode, SerializedTable, ShadowFrame, SECURE_ADDR_BIT,
};
use crate::pma::{MemoryType, PmaInfo, PmaRegion};
use crate::pmp::{PmpPerms, PmpRegion, PmpRegisters};
use crate::types::{Address, AddressConstraint, AddressKind, AddressTable, Qualifiers};

/// Shared map every root anchor is registered in.
pub const PRIMARY_MAP: &str = "map_os";
/// G-stage map, present when two-stage translation is configured.
pub const G_MAP: &str = "map_hyp";

/// One page to place and map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub name: String,
    /// Name of the physical frame; pages sharing it share the frame.
    pub phys_name: Option<String>,
    pub lin_addr: Option<u64>,
    pub phys_addr: Option<u64>,
    pub size: PageSize,
    pub g_leaf_size: Option<PageSize>,
    pub g_nonleaf_size: Option<PageSize>,
    /// Empty means the default map.
    pub maps: Vec<String>,
    pub private: bool,
    pub attrs: AttrTable,
    /// Physical qualifiers; empty means DRAM.
    pub qualifiers: Qualifiers,
    pub no_pbmt_ncio: bool,
    /// Linear address equal to the physical one, free in both spaces.
    pub identity: bool,
    /// The linear name may already be registered; the new value replaces it.
    pub alias: bool,
}

impl PageRequest {
    pub fn new(name: impl Into<String>, size: PageSize) -> Self {
        Self {
            name: name.into(),
            phys_name: None,
            lin_addr: None,
            phys_addr: None,
            size,
            g_leaf_size: None,
            g_nonleaf_size: None,
            maps: Vec::new(),
            private: false,
            attrs: AttrTable::new(),
            qualifiers: Qualifiers::empty(),
            no_pbmt_ncio: false,
            identity: false,
            alias: false,
        }
    }

    pub fn at_lin(mut self, addr: u64) -> Self {
        self.lin_addr = Some(addr);
        self
    }

    pub fn at_phys(mut self, addr: u64) -> Self {
        self.phys_addr = Some(addr);
        self
    }

    pub fn phys_name(mut self, name: impl Into<String>) -> Self {
        self.phys_name = Some(name.into());
        self
    }

    pub fn in_map(mut self, map: impl Into<String>) -> Self {
        self.maps.push(map.into());
        self
    }

    pub fn with_attrs(mut self, attrs: AttrTable) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn with_qualifiers(mut self, qualifiers: Qualifiers) -> Self {
        self.qualifiers = qualifiers;
        self
    }

    pub fn with_g_sizes(mut self, leaf: Option<PageSize>, nonleaf: Option<PageSize>) -> Self {
        self.g_leaf_size = leaf;
        self.g_nonleaf_size = nonleaf;
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }

    fn frame_name(&self) -> String {
        self.phys_name.clone().unwrap_or_else(|| format!("{}__phys", self.name))
    }
}

/// Everything a run hands to the emission layer.
#[derive(Debug)]
pub struct GenOutput {
    pub addresses: AddressTable,
    pub pages: PageArena,
    pub maps: Vec<PageMap>,
    /// Serialized tables per map, in map creation order.
    pub tables: Vec<(String, Vec<SerializedTable>)>,
    pub pma: Vec<PmaInfo>,
    pub pmp: Vec<PmpRegisters>,
}

impl GenOutput {
    pub fn map(&self, name: &str) -> Option<&PageMap> {
        self.maps.iter().find(|m| m.name() == name)
    }

    pub fn tables(&self, name: &str) -> Option<&[SerializedTable]> {
        self.tables.iter().find(|(n, _)| n == name).map(|(_, t)| t.as_slice())
    }

    pub fn page(&self, name: &str) -> Option<&Page> {
        self.pages.find(name).map(|id| self.pages.get(id))
    }

    /// Translates `va` through `map`, then through the G map when `map` is a
    /// VS map of a two-stage run.
    pub fn translate(&self, map: &str, va: u64) -> Option<u64> {
        let first = self.map(map)?;
        let pa = if first.mode() == PagingMode::Bare { va } else { first.translate(va)?.pa };
        match self.map(G_MAP) {
            Some(g) if !first.is_gstage() => Some(g.translate(pa)?.pa),
            _ => Some(pa),
        }
    }

    /// Listing of every map's tables and walks.
    pub fn dump(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GenOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for map in &self.maps {
            writeln!(f, "{}", map.listing(&self.pages))?;
        }
        Ok(())
    }
}

/// Owned state of one generation run.
pub struct GenContext {
    config: GenConfig,
    rng: SeededRng,
    addrgen: AddrGen,
    addresses: AddressTable,
    arena: PageArena,
    maps: Vec<PageMap>,
    requests: Vec<PageRequest>,
    pma: PmaRegion,
    pmp: PmpRegion,
}

impl GenContext {
    /// Sets up the allocator from the memory map and seeds one PMA and one
    /// RWX PMP region per DRAM and secure range.
    pub fn new(config: GenConfig) -> Result<Self> {
        let addrgen = AddrGen::new(&config.memory).with_filter_config(config.addr_filter);
        let mut maps = vec![PageMap::new(PRIMARY_MAP, config.paging_mode, false, true)];
        if config.nested() {
            maps.push(PageMap::new(G_MAP, config.paging_g_mode, true, false));
        }

        let mut pma = PmaRegion::new();
        let mut pmp = PmpRegion::default();
        for r in config.memory.dram.iter().filter(|r| !r.is_empty()) {
            pma.add_region(r.start, r.size, MemoryType::Memory);
            pmp.add_region(r.start, r.size, PmpPerms::all())?;
        }
        for r in config.memory.secure.iter().filter(|r| !r.is_empty()) {
            let base = r.start | SECURE_ADDR_BIT;
            pma.add_region(base, r.size, MemoryType::Memory);
            pmp.add_region(base, r.size, PmpPerms::all())?;
        }
        for r in config.memory.io.iter().filter(|r| !r.is_empty()) {
            pma.add_region(r.start, r.size, MemoryType::Io);
        }

        info!(
            target: "mmgen",
            "seed {:#x}, {} / g {}, {:?}",
            config.seed, config.paging_mode, config.paging_g_mode, config.priv_mode
        );
        Ok(Self {
            rng: SeededRng::new(config.seed),
            config,
            addrgen,
            addresses: AddressTable::default(),
            arena: PageArena::new(),
            maps,
            requests: Vec::new(),
            pma,
            pmp,
        })
    }

    pub fn config(&self) -> &GenConfig {
        &self.config
    }

    pub fn addresses(&self) -> &AddressTable {
        &self.addresses
    }

    fn map_index(&self, name: &str) -> Option<usize> {
        self.maps.iter().position(|m| m.name() == name)
    }

    /// Adds a single-stage user map.
    pub fn add_map(&mut self, name: &str, mode: PagingMode) -> Result<()> {
        if self.map_index(name).is_some() {
            return Err(Error::DuplicateMap(name.to_owned()));
        }
        self.maps.push(PageMap::new(name, mode, false, false));
        Ok(())
    }

    pub fn reserve(&mut self, kind: AddressKind, start: u64, size: u64) -> Result<()> {
        self.addrgen.reserve(kind, start, size)
    }

    /// Generates and records a named address.
    pub fn generate(&mut self, name: &str, constraint: &AddressConstraint) -> Result<u64> {
        let value = self.addrgen.generate(constraint, &mut self.rng)?;
        self.addresses.insert(Address::new(name, constraint.kind, value, constraint.size))?;
        Ok(value)
    }

    /// Queues a page. Every named map must already exist.
    pub fn declare(&mut self, request: PageRequest) -> Result<()> {
        if let Some(missing) = request.maps.iter().find(|m| self.map_index(m).is_none()) {
            return Err(Error::UnknownMap(missing.clone()));
        }
        self.requests.push(request);
        Ok(())
    }

    pub fn add_pma_region(&mut self, info: PmaInfo) {
        self.pma.add_entry(info);
    }

    fn default_map(&self) -> &'static str {
        if self.config.paging_mode == PagingMode::Bare && self.config.nested() {
            G_MAP
        } else {
            PRIMARY_MAP
        }
    }

    fn owning_maps(&self, request: &PageRequest) -> Vec<usize> {
        if request.maps.is_empty() {
            return self.map_index(self.default_map()).into_iter().collect();
        }
        request.maps.iter().filter_map(|m| self.map_index(m)).collect()
    }

    /// Linear bits usable by every non-bare map in `maps`, `None` when all are bare.
    fn linear_bits(&self, maps: &[usize]) -> Option<u32> {
        maps.iter()
            .map(|&i| &self.maps[i])
            .filter(|m| m.mode() != PagingMode::Bare)
            .map(|m| m.mode().va_bits(m.is_gstage()) - 1)
            .min()
    }

    /// Width of guest-physical addresses the G map can translate, 64 when
    /// there is no G stage.
    fn guest_phys_bits(&self) -> u32 {
        if self.config.nested() {
            self.config.paging_g_mode.va_bits(true)
        } else {
            u64::BITS
        }
    }

    fn physical_bits(&self, maps: &[usize]) -> u32 {
        let mut bits = self.config.physical_addr_bits;
        for map in maps.iter().map(|&i| &self.maps[i]).filter(|m| m.mode() != PagingMode::Bare) {
            bits = bits.min(map.mode().max_pa_bits());
            if !map.is_gstage() {
                bits = bits.min(self.guest_phys_bits());
            }
        }
        bits
    }

    fn reserve_fixed(&mut self) -> Result<()> {
        for request in &self.requests {
            let size = request.size.bytes();
            if let Some(lin) = request.lin_addr {
                self.addrgen.reserve(AddressKind::Linear, lin, size)?;
            }
            if let Some(phys) = request.phys_addr {
                self.addrgen.reserve(AddressKind::Physical, phys, size)?;
            }
        }
        Ok(())
    }

    /// Allocates roots, registers anchors in the primary map and mirrors VS
    /// roots into the G map.
    fn initialize_maps(&mut self, shadows: &mut Vec<ShadowFrame>) -> Result<()> {
        let nested = self.config.nested();
        let primary = self.map_index(PRIMARY_MAP);
        for i in 0..self.maps.len() {
            if self.maps[i].mode() == PagingMode::Bare {
                continue;
            }
            let anchor = self.maps[i].initialize(
                &mut self.addrgen,
                &mut self.rng,
                &mut self.addresses,
                self.config.root_table_addr_bits,
            )?;
            let base = anchor.lin_addr.unwrap_or_default();
            if nested && !self.maps[i].is_gstage() {
                shadows.mirror(ShadowFrame {
                    name: format!("{}_sptbr__gpa", self.maps[i].name()),
                    gpa: base,
                    size: PageSize::Size4K,
                    vs_level: self.maps[i].mode().levels() - 1,
                    leaf: false,
                    attrs: AttrTable::new().shadow_for(0),
                });
            }
            let id = self.arena.push(anchor);
            if let Some(p) = primary.filter(|&p| self.maps[p].mode() != PagingMode::Bare) {
                self.maps[p].add_page(id, &mut self.arena);
            }
        }
        Ok(())
    }

    fn resolve(&mut self, index: usize) -> Result<()> {
        let maps = self.owning_maps(&self.requests[index]);
        let lin_bits = self.linear_bits(&maps);
        let phys_bits = self.physical_bits(&maps);
        let nested = self.config.nested();
        let request = &self.requests[index];
        let size = request.size.bytes();
        let frame = request.frame_name();

        let mut align = size;
        if nested {
            if let Some(g) = request.g_leaf_size {
                align = align.max(g.bytes());
            }
        }
        let qualifiers = if request.qualifiers.is_empty() { Qualifiers::DRAM } else { request.qualifiers };
        let phys_constraint =
            AddressConstraint::new(AddressKind::Physical, size).aligned_to(align).with_qualifiers(qualifiers);

        let (mut lin, mut phys) = (request.lin_addr, request.phys_addr);
        if request.identity && lin.is_none() && phys.is_none() {
            let bits = lin_bits.map_or(phys_bits, |l| l.min(phys_bits));
            let addr = self.addrgen.generate_identity(&phys_constraint.clone().with_bits(bits), &mut self.rng)?;
            lin = Some(addr);
            phys = Some(addr);
        }
        if phys.is_none() {
            phys = match self.addresses.value(AddressKind::Physical, &frame) {
                Some(shared) => Some(shared),
                None => Some(self.addrgen.generate(&phys_constraint.with_bits(phys_bits), &mut self.rng)?),
            };
        }
        if lin.is_none() {
            lin = match lin_bits {
                None => phys,
                Some(bits) => {
                    let c = AddressConstraint::new(AddressKind::Linear, size).aligned_to(size).with_bits(bits);
                    Some(self.addrgen.generate(&c, &mut self.rng)?)
                }
            };
        }

        let request = &mut self.requests[index];
        request.lin_addr = lin;
        request.phys_addr = phys;
        let (lin, phys) = (lin.unwrap_or_default(), phys.unwrap_or_default());
        let linear = Address::new(request.name.clone(), AddressKind::Linear, lin, size);
        if request.alias {
            self.addresses.insert_alias(linear);
        } else {
            self.addresses.insert(linear)?;
        }
        self.addresses.insert_if_absent(Address::new(frame, AddressKind::Physical, phys, size));
        debug!(target: "mmgen", "{}: lin {:#x} phys {:#x} {}", request.name, lin, phys, request.size);
        Ok(())
    }

    fn register_pages(&mut self) -> Vec<PageId> {
        let mut ids = Vec::with_capacity(self.requests.len());
        for i in 0..self.requests.len() {
            let maps = self.owning_maps(&self.requests[i]);
            let request = &self.requests[i];
            let mut page = Page::new(request.name.clone(), request.size);
            page.phys_name = request.frame_name();
            page.lin_addr = request.lin_addr;
            page.phys_addr = request.phys_addr;
            page.g_leaf_size = request.g_leaf_size;
            page.g_nonleaf_size = request.g_nonleaf_size;
            page.private = request.private;
            page.no_pbmt_ncio = request.no_pbmt_ncio;
            page.attrs = request.attrs.clone();
            page.maps = maps.iter().map(|&m| self.maps[m].name().to_owned()).collect();
            let id = self.arena.push(page);
            for m in maps {
                self.maps[m].add_page(id, &mut self.arena);
            }
            ids.push(id);
        }
        ids
    }

    /// Queues shadow frames on the G map, one per guest-physical address. The
    /// secure tag is not part of the guest-physical address.
    fn queue_shadows(&mut self, shadows: Vec<ShadowFrame>) {
        let Some(g) = self.map_index(G_MAP) else {
            return;
        };
        let mut seen = BTreeSet::new();
        for shadow in shadows {
            let gpa = shadow.gpa & !SECURE_ADDR_BIT & shadow.size.mask();
            if !seen.insert(gpa) {
                continue;
            }
            let bytes = shadow.size.bytes();
            self.addresses.insert_if_absent(Address::new(shadow.name.clone(), AddressKind::Linear, gpa, bytes));
            self.addresses.insert_if_absent(Address::new(shadow.name.clone(), AddressKind::Physical, gpa, bytes));
            let mut page = Page::new(shadow.name, shadow.size).with_lin(gpa).with_phys(gpa).in_map(G_MAP);
            page.phys_name = page.name.clone();
            page.no_pbmt_ncio = !shadow.leaf;
            page.attrs = shadow.attrs;
            let id = self.arena.push(page);
            self.maps[g].add_pt_page(id);
        }
        debug!(target: "mmgen", "{} shadow frames queued on {}", seen.len(), G_MAP);
    }

    fn build_map(&mut self, index: usize, shadows: Option<&mut Vec<ShadowFrame>>) -> Result<()> {
        let mut phys_bits = self.config.physical_addr_bits;
        if !self.maps[index].is_gstage() {
            phys_bits = phys_bits.min(self.guest_phys_bits());
        }
        let mut ctx = WalkCtx {
            addrgen: &mut self.addrgen,
            rng: &mut self.rng,
            addresses: &mut self.addresses,
            policy: AttrPolicy::from_config(&self.config),
            frames: FramePolicy {
                phys_bits,
                secure_mode: self.config.secure_mode,
                secure_probability: self.config.secure_pt_probability,
            },
            nested: shadows.map(|sink| sink as &mut dyn NestedSink),
        };
        self.maps[index].create_pagetables(&mut self.arena, &mut ctx)
    }

    /// Executes the run and hands back its results.
    pub fn run(mut self) -> Result<GenOutput> {
        let nested = self.config.nested();
        self.reserve_fixed()?;

        let mut shadows = Vec::new();
        self.initialize_maps(&mut shadows)?;

        for i in 0..self.requests.len() {
            self.resolve(i)?;
        }
        let pages = self.register_pages();
        info!(target: "mmgen", "{} pages across {} maps", pages.len(), self.maps.len());

        for i in 0..self.maps.len() {
            if self.maps[i].is_gstage() {
                continue;
            }
            let sink = if nested { Some(&mut shadows) } else { None };
            self.build_map(i, sink)?;
        }
        if let Some(g) = self.map_index(G_MAP) {
            self.queue_shadows(shadows);
            self.build_map(g, None)?;
        }

        let tables = self.maps.iter().map(|m| (m.name().to_owned(), m.serialize())).collect();
        let pma = self.pma.consolidated_entries();
        let pmp = self.pmp.encode()?;
        info!(target: "mmgen", "{} addresses, {} PMA, {} PMP cfg registers", self.addresses.len(), pma.len(), pmp.len());
        Ok(GenOutput { addresses: self.addresses, pages: self.arena, maps: self.maps, tables, pma, pmp })
    }
}
