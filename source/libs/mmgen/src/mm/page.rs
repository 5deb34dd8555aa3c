// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page records and the arena that owns them for one run.

use std::fmt;

use super::attrs::AttrTable;
use super::PageSize;

/// Handle of a page inside a [`PageArena`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(usize);

impl PageId {
    #[inline]
    pub fn raw(self) -> usize {
        self.0
    }
}

/// One entry touched while walking a page through a map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkRecord {
    pub map: String,
    pub level: usize,
    pub table_base: u64,
    pub index: usize,
    pub raw: u64,
    pub leaf: bool,
    /// The entry already existed and was descended through.
    pub reused: bool,
}

impl fmt::Display for WalkRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} L{} table={:#x}[{:#x}] pte={:#018x}{}{}",
            self.map,
            self.level,
            self.table_base,
            self.index,
            self.raw,
            if self.leaf { " leaf" } else { "" },
            if self.reused { " reused" } else { "" },
        )
    }
}

/// One linear to physical mapping request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    pub name: String,
    pub phys_name: String,
    pub lin_addr: Option<u64>,
    pub phys_addr: Option<u64>,
    pub size: PageSize,
    /// G-stage granule mirroring this page's leaf frame.
    pub g_leaf_size: Option<PageSize>,
    /// G-stage granule and allocation size of VS table frames this page creates.
    pub g_nonleaf_size: Option<PageSize>,
    pub maps: Vec<String>,
    pub private: bool,
    pub no_pbmt_ncio: bool,
    pub attrs: AttrTable,
    pub(crate) root_anchor_of: Option<String>,
    pub(crate) walk: Vec<WalkRecord>,
}

impl Page {
    pub fn new(name: impl Into<String>, size: PageSize) -> Self {
        let name = name.into();
        Self {
            phys_name: format!("{name}__phys"),
            name,
            lin_addr: None,
            phys_addr: None,
            size,
            g_leaf_size: None,
            g_nonleaf_size: None,
            maps: Vec::new(),
            private: false,
            no_pbmt_ncio: false,
            attrs: AttrTable::new(),
            root_anchor_of: None,
            walk: Vec::new(),
        }
    }

    pub fn with_lin(mut self, addr: u64) -> Self {
        self.lin_addr = Some(addr);
        self
    }

    pub fn with_phys(mut self, addr: u64) -> Self {
        self.phys_addr = Some(addr);
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

    /// Anchor page of `map`'s root table, skipped when walking `map` itself.
    pub(crate) fn anchor(map: &str, base: u64) -> Self {
        let mut page = Page::new(format!("{map}_sptbr"), PageSize::Size4K).with_lin(base).with_phys(base);
        page.phys_name = page.name.clone();
        page.no_pbmt_ncio = true;
        page.root_anchor_of = Some(map.to_owned());
        page
    }

    pub fn is_anchor_of(&self, map: &str) -> bool {
        self.root_anchor_of.as_deref() == Some(map)
    }

    /// Entries written or reused for this page, across every map it was walked in.
    pub fn walk(&self) -> &[WalkRecord] {
        &self.walk
    }
}

#[derive(Clone, Debug, Default)]
pub struct PageArena {
    pages: Vec<Page>,
}

impl PageArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, page: Page) -> PageId {
        self.pages.push(page);
        PageId(self.pages.len() - 1)
    }

    pub fn get(&self, id: PageId) -> &Page {
        &self.pages[id.0]
    }

    pub fn get_mut(&mut self, id: PageId) -> &mut Page {
        &mut self.pages[id.0]
    }

    pub fn find(&self, name: &str) -> Option<PageId> {
        self.pages.iter().position(|p| p.name == name).map(PageId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageId, &Page)> {
        self.pages.iter().enumerate().map(|(i, p)| (PageId(i), p))
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_ids_are_stable() {
        let mut arena = PageArena::new();
        let a = arena.push(Page::new("code", PageSize::Size4K));
        let b = arena.push(Page::new("data", PageSize::Size2M));
        assert_eq!(arena.get(a).name, "code");
        assert_eq!(arena.get(b).size, PageSize::Size2M);
        assert_eq!(arena.find("data"), Some(b));
        assert_eq!(arena.find("stack"), None);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn anchor_is_identity_and_tagged() {
        let page = Page::anchor("map_os", 0x8000_4000);
        assert_eq!(page.name, "map_os_sptbr");
        assert_eq!(page.lin_addr, page.phys_addr);
        assert!(page.is_anchor_of("map_os"));
        assert!(!page.is_anchor_of("map_hyp"));
    }

    #[test]
    fn builder_sets_addresses_and_maps() {
        let page = Page::new("buf", PageSize::Size4K).with_lin(0x1000).with_phys(0x8000_1000).in_map("map_os");
        assert_eq!(page.phys_name, "buf__phys");
        assert_eq!(page.maps, vec!["map_os".to_owned()]);
        assert!(page.walk().is_empty());
    }
}
