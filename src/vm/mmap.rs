//! Memory-mapped files
//!
//! `mmap` covers a page-aligned region with lazy file-backed pages, each
//! holding its own reopened handle so the caller may close its descriptor.
//! `munmap` tears a region down by its start address, writing dirty pages
//! back to the file.

use alloc::vec::Vec;

use crate::fs::FileHandle;

use super::address_space::AddressSpace;
use super::error::{VmError, VmResult};
use super::page::{Page, PageFlags, PendingLoad, VmType};
use super::{pg_ofs, round_page, PAGE_SIZE};

impl AddressSpace {
    /// Map `length` bytes of `file` starting at `offset` to `addr`.
    /// Returns `addr` on success.
    pub fn mmap(
        &self,
        addr: u64,
        length: u64,
        writable: bool,
        file: &FileHandle,
        offset: u64,
    ) -> VmResult<u64> {
        if length == 0 || addr == 0 {
            return Err(VmError::InvalidArgument);
        }
        if pg_ofs(addr) != 0 {
            return Err(VmError::Misaligned(addr));
        }
        if pg_ofs(offset) != 0 {
            return Err(VmError::Misaligned(offset));
        }
        let file_len = file.length();
        if file_len == 0 {
            return Err(VmError::InvalidArgument);
        }
        let span = round_page(length).ok_or(VmError::InvalidArgument)?;
        let end = addr.checked_add(span).ok_or(VmError::InvalidArgument)?;
        // Every page's file offset must be representable
        offset.checked_add(span).ok_or(VmError::InvalidArgument)?;
        if end > self.config().kern_base {
            return Err(VmError::InvalidArgument);
        }

        // Bytes of the region that come from the file
        let backed = length.min(file_len.saturating_sub(offset));
        let pages = span / PAGE_SIZE as u64;
        let flags = PageFlags::writable(writable);

        let mut spt = self.spt();
        if spt.overlaps(addr, end) {
            return Err(VmError::AlreadyMapped(addr));
        }
        let region = spt.add_mapping(addr, length, pages);

        for (i, va) in region.page_addrs().enumerate() {
            let page_ofs = (i * PAGE_SIZE) as u64;
            let read_bytes = backed.saturating_sub(page_ofs).min(PAGE_SIZE as u64) as usize;
            let load = PendingLoad::new(file.reopen(), offset + page_ofs, read_bytes);

            let mut page = Page::new(va, VmType::File, flags, None, Some(load));
            page.set_mapping(Some(region.id));
            let inserted = spt.insert(page);
            debug_assert!(inserted.is_ok());
        }

        log::debug!(
            "mmap: {:?} at {:#x}, {} bytes ({} pages)",
            region.id,
            addr,
            length,
            pages
        );
        Ok(addr)
    }

    /// Unmap the region that starts at `addr`
    pub fn munmap(&self, addr: u64) -> VmResult<()> {
        let pages: Vec<Page> = {
            let mut spt = self.spt();
            let region = spt.remove_mapping(addr).ok_or(VmError::NotMapped(addr))?;
            let mut pages = Vec::with_capacity(region.pages as usize);
            for va in region.page_addrs() {
                if spt.find(va).and_then(Page::mapping) == Some(region.id) {
                    if let Some(page) = spt.remove(va) {
                        pages.push(page);
                    }
                }
            }
            log::debug!("munmap: {:?} at {:#x}", region.id, addr);
            pages
        };
        self.destroy_pages(pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::RamDisk;
    use crate::fs::MemFile;
    use crate::vm::config::VmConfig;
    use crate::vm::palloc::HeapPool;
    use crate::vm::pmap::SoftPmap;
    use crate::vm::Vm;
    use alloc::sync::Arc;
    use alloc::vec;

    fn setup() -> Arc<AddressSpace> {
        let vm = Vm::new(
            VmConfig::DEFAULT,
            Arc::new(HeapPool::new(8)),
            Arc::new(RamDisk::new(64)),
        );
        AddressSpace::new(vm, Arc::new(SoftPmap::new()))
    }

    #[test]
    fn test_mmap_validation() {
        let space = setup();
        let file: FileHandle = MemFile::new(vec![1u8; 100]);
        let empty: FileHandle = MemFile::new(vec![]);

        assert_eq!(space.mmap(0x10000, 0, true, &file, 0), Err(VmError::InvalidArgument));
        assert_eq!(space.mmap(0, 100, true, &file, 0), Err(VmError::InvalidArgument));
        assert_eq!(space.mmap(0x10010, 100, true, &file, 0), Err(VmError::Misaligned(0x10010)));
        assert_eq!(space.mmap(0x10000, 100, true, &file, 3), Err(VmError::Misaligned(3)));
        assert_eq!(space.mmap(0x10000, 100, true, &empty, 0), Err(VmError::InvalidArgument));

        let kern = VmConfig::DEFAULT.kern_base;
        assert_eq!(space.mmap(kern - 0x1000, 0x2000, true, &file, 0), Err(VmError::InvalidArgument));

        // File offsets of later pages would wrap past u64::MAX
        let top = u64::MAX & !0xfff;
        assert_eq!(space.mmap(0x10000, 0x2000, true, &file, top), Err(VmError::InvalidArgument));
        assert_eq!(space.mmap(0x10000, 0x1000, true, &file, top), Err(VmError::InvalidArgument));
        assert!(space.spt().mapping_at(0x10000).is_none());
        assert_eq!(space.page_count(), 0);
    }

    #[test]
    fn test_mmap_overlap() {
        let space = setup();
        let file: FileHandle = MemFile::new(vec![1u8; 100]);
        space.alloc_page(VmType::Anon, 0x11000, true).unwrap();
        assert_eq!(space.mmap(0x10000, 0x2000, true, &file, 0), Err(VmError::AlreadyMapped(0x10000)));
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn test_mmap_geometry() {
        let space = setup();
        let file: FileHandle = MemFile::new(vec![1u8; PAGE_SIZE + 10]);
        space.mmap(0x10000, 3 * PAGE_SIZE as u64, false, &file, 0).unwrap();

        let first = space.page_info(0x10000).unwrap();
        let second = space.page_info(0x11000).unwrap();
        let third = space.page_info(0x12000).unwrap();
        assert_eq!(first.read_bytes, Some(PAGE_SIZE));
        assert_eq!(second.read_bytes, Some(10));
        assert_eq!(second.zero_bytes, Some(PAGE_SIZE - 10));
        assert_eq!(third.read_bytes, Some(0));
        assert_eq!(first.target, VmType::File);
        assert!(!first.writable);
        assert_eq!(first.mapping, third.mapping);
    }

    #[test]
    fn test_munmap_removes_region() {
        let space = setup();
        let file: FileHandle = MemFile::new(vec![1u8; 100]);
        space.mmap(0x10000, 100, true, &file, 0).unwrap();
        assert_eq!(space.munmap(0x11000), Err(VmError::NotMapped(0x11000)));
        space.munmap(0x10000).unwrap();
        assert_eq!(space.page_count(), 0);
        assert_eq!(space.munmap(0x10000), Err(VmError::NotMapped(0x10000)));
    }
}
