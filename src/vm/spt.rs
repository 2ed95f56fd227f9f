//! Supplemental Page Table
//!
//! Per-address-space record of every user page, keyed by page address. The
//! hardware page table only knows about resident pages; this table also
//! knows about lazy, swapped-out and file-backed pages, and is what the
//! fault handler consults to decide how to resolve a fault.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::page::Page;
use super::trunc_page;

// ============================================================================
// Mappings
// ============================================================================

/// Identifier of an mmap region within one address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(pub u32);

/// A live mmap region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRegion {
    pub id: MappingId,
    /// First mapped address (page-aligned)
    pub start: u64,
    /// Length requested by the caller in bytes
    pub length: u64,
    /// Number of pages covering the region
    pub pages: u64,
}

impl MmapRegion {
    /// Page addresses covered by the region
    pub fn page_addrs(&self) -> impl Iterator<Item = u64> {
        let start = self.start;
        (0..self.pages).map(move |i| start + i * super::PAGE_SIZE as u64)
    }
}

// ============================================================================
// Supplemental Page Table
// ============================================================================

/// Page address -> Page, plus the address space's mmap regions
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, Page>,
    mappings: BTreeMap<u64, MmapRegion>,
    next_mapping: u32,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page containing `va`: one keyed lookup on the rounded address
    pub fn find(&self, va: u64) -> Option<&Page> {
        self.pages.get(&trunc_page(va))
    }

    pub fn find_mut(&mut self, va: u64) -> Option<&mut Page> {
        self.pages.get_mut(&trunc_page(va))
    }

    pub fn contains(&self, va: u64) -> bool {
        self.pages.contains_key(&trunc_page(va))
    }

    /// Insert `page`; fails (returning it) if its address is already taken
    pub fn insert(&mut self, page: Page) -> Result<(), Page> {
        if self.pages.contains_key(&page.va()) {
            return Err(page);
        }
        self.pages.insert(page.va(), page);
        Ok(())
    }

    /// Detach the page at `va` without tearing it down
    pub fn remove(&mut self, va: u64) -> Option<Page> {
        self.pages.remove(&trunc_page(va))
    }

    /// Detach every page and forget every mapping
    pub fn take_all(&mut self) -> Vec<Page> {
        self.mappings.clear();
        core::mem::take(&mut self.pages).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    /// Whether any page lies in `[start, end)`
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.pages.range(start..end).next().is_some()
    }

    /// Record a new mmap region and return its id
    pub fn add_mapping(&mut self, start: u64, length: u64, pages: u64) -> MmapRegion {
        let region = MmapRegion {
            id: MappingId(self.next_mapping),
            start,
            length,
            pages,
        };
        self.next_mapping += 1;
        self.mappings.insert(start, region);
        region
    }

    /// Re-record a region copied from another table, keeping its id
    pub fn restore_mapping(&mut self, region: MmapRegion) {
        self.next_mapping = self.next_mapping.max(region.id.0 + 1);
        self.mappings.insert(region.start, region);
    }

    pub fn mapping_at(&self, start: u64) -> Option<&MmapRegion> {
        self.mappings.get(&start)
    }

    pub fn remove_mapping(&mut self, start: u64) -> Option<MmapRegion> {
        self.mappings.remove(&start)
    }

    pub fn mappings(&self) -> impl Iterator<Item = &MmapRegion> {
        self.mappings.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::{PageFlags, VmType};

    fn page(va: u64) -> Page {
        Page::new(va, VmType::Anon, PageFlags::WRITABLE, None, None)
    }

    #[test]
    fn test_insert_find() {
        let mut spt = SupplementalPageTable::new();
        assert!(spt.insert(page(0x1000)).is_ok());
        assert!(spt.insert(page(0x1000)).is_err());

        assert_eq!(spt.find(0x1abc).map(Page::va), Some(0x1000));
        assert!(spt.find(0x2000).is_none());
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn test_find_is_keyed_by_page_address() {
        let mut spt = SupplementalPageTable::new();
        for i in 0..64u64 {
            spt.insert(page(0x10_0000 + i * 0x3000)).unwrap();
        }
        for i in 0..64u64 {
            let va = 0x10_0000 + i * 0x3000;
            assert_eq!(spt.find(va + 0xfff).map(Page::va), Some(va));
            assert!(spt.find(va + 0x1000).is_none());
        }
    }

    #[test]
    fn test_overlaps() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x5000)).unwrap();
        assert!(spt.overlaps(0x4000, 0x6000));
        assert!(!spt.overlaps(0x6000, 0x8000));
        assert!(!spt.overlaps(0x1000, 0x5000));
    }

    #[test]
    fn test_mappings() {
        let mut spt = SupplementalPageTable::new();
        let a = spt.add_mapping(0x10000, 100, 1);
        let b = spt.add_mapping(0x20000, 8192, 2);
        assert_ne!(a.id, b.id);
        assert_eq!(b.page_addrs().collect::<Vec<_>>(), [0x20000u64, 0x21000]);

        assert_eq!(spt.remove_mapping(0x10000), Some(a));
        assert!(spt.mapping_at(0x10000).is_none());

        let mut other = SupplementalPageTable::new();
        other.restore_mapping(b);
        assert_eq!(other.add_mapping(0x30000, 1, 1).id, MappingId(b.id.0 + 1));
    }

    #[test]
    fn test_take_all() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x1000)).unwrap();
        spt.insert(page(0x2000)).unwrap();
        spt.add_mapping(0x1000, 10, 1);
        assert_eq!(spt.take_all().len(), 2);
        assert!(spt.is_empty());
        assert_eq!(spt.mappings().count(), 0);
    }
}
