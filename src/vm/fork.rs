//! Address-space copy for fork
//!
//! The child gets an independent copy of every parent page. Lazy pages stay
//! lazy (with reopened files), swapped-out anonymous pages get a fresh slot
//! holding the same bytes, and resident pages get a new frame filled from
//! the parent's frame, which is pinned for the duration of the copy.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::address_space::AddressSpace;
use super::error::VmResult;
use super::frame::{copy_frame, Frame};
use super::page::Page;

impl AddressSpace {
    /// Copy every page and mmap region of `src` into this (empty) address
    /// space. On failure everything copied so far is destroyed.
    pub fn copy_from(&self, src: &AddressSpace) -> VmResult<()> {
        let (vas, regions): (Vec<u64>, Vec<_>) = {
            let spt = src.spt();
            (spt.pages().map(Page::va).collect(), spt.mappings().copied().collect())
        };

        {
            let mut dst = self.spt();
            for region in regions {
                dst.restore_mapping(region);
            }
        }

        for va in vas {
            if let Err(e) = self.copy_page(src, va) {
                log::debug!("fork: copy of {:#x} failed: {}", va, e);
                self.kill();
                return Err(e);
            }
        }
        log::debug!("fork: copied {} pages", self.page_count());
        Ok(())
    }

    fn copy_page(&self, src: &AddressSpace, va: u64) -> VmResult<()> {
        // Snapshot the parent page; pin its frame so it cannot be evicted
        // while we copy from it.
        let (copy, parent_frame, dirty) = {
            let spt = src.spt();
            let Some(page) = spt.find(va) else {
                return Ok(());
            };
            let copy = page.duplicate(self.vm().swap())?;
            let frame = page.frame().cloned();
            if let Some(frame) = &frame {
                frame.pin();
            }
            let dirty = frame.is_some() && src.pmap().is_dirty(va);
            (copy, frame, dirty)
        };

        let Some(parent_frame) = parent_frame else {
            let mut dst = self.spt();
            if let Err(page) = dst.insert(copy) {
                drop(dst);
                self.destroy_pages(alloc::vec![page]);
            }
            return Ok(());
        };

        let child_frame = self.vm().frames().get_frame();
        let result = child_frame.and_then(|child| {
            copy_frame(parent_frame.kva(), child.kva());
            self.install_copy(copy, child, dirty)
        });
        parent_frame.unpin();
        result
    }

    fn install_copy(&self, copy: Page, child: Arc<Frame>, dirty: bool) -> VmResult<()> {
        if let Err(e) = self.install_filled(copy, &child, dirty) {
            self.vm().frames().free_frame(&child);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::RamDisk;
    use crate::vm::config::VmConfig;
    use crate::vm::palloc::HeapPool;
    use crate::vm::pmap::{Pmap, SoftPmap};
    use crate::vm::error::VmError;
    use crate::vm::{Vm, VmType};

    #[test]
    fn test_copy_lazy_and_resident() {
        let vm = Vm::new(VmConfig::DEFAULT, Arc::new(HeapPool::new(8)), Arc::new(RamDisk::new(64)));
        let parent_pmap = Arc::new(SoftPmap::new());
        let parent = AddressSpace::new(vm.clone(), parent_pmap.clone());
        parent.alloc_page(VmType::Anon, 0x1000, true).unwrap();
        parent.alloc_page(VmType::Anon, 0x2000, true).unwrap();
        parent.claim_page(0x2000).unwrap();
        parent_pmap.write(0x2000, &[0xaa]).unwrap();

        let child_pmap = Arc::new(SoftPmap::new());
        let child = AddressSpace::new(vm.clone(), child_pmap.clone());
        child.copy_from(&parent).unwrap();

        assert_eq!(child.page_count(), 2);
        assert!(!child.page_info(0x1000).unwrap().resident);
        assert!(child.page_info(0x2000).unwrap().resident);
        assert_ne!(child.inspect(0x2000), parent.inspect(0x2000));

        let mut byte = [0u8; 1];
        child_pmap.read(0x2000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xaa);
        assert!(child_pmap.is_dirty(0x2000));
    }

    #[test]
    fn test_copy_failure_cleans_up() {
        let vm = Vm::new(VmConfig::DEFAULT, Arc::new(HeapPool::new(4)), Arc::new(RamDisk::new(64)));
        let parent = AddressSpace::new(vm.clone(), Arc::new(SoftPmap::new()));
        parent.alloc_page(VmType::Anon, 0x1000, true).unwrap();
        parent.alloc_page(VmType::Anon, 0x2000, true).unwrap();
        parent.claim_page(0x1000).unwrap();

        let pmap = Arc::new(SoftPmap::new());
        pmap.set_failing(true);
        let child = AddressSpace::new(vm, pmap);
        assert!(child.copy_from(&parent).is_err());
        assert_eq!(child.page_count(), 0);
        assert_eq!(parent.vm().frames().len(), 1);
    }

    #[test]
    fn test_parent_frame_is_pinned_during_copy() {
        let vm = Vm::new(VmConfig::DEFAULT, Arc::new(HeapPool::new(1)), Arc::new(RamDisk::new(64)));
        let parent = AddressSpace::new(vm.clone(), Arc::new(SoftPmap::new()));
        parent.alloc_page(VmType::Anon, 0x1000, true).unwrap();
        parent.claim_page(0x1000).unwrap();

        // The only frame is the parent's, and it cannot be taken while copying
        let child = AddressSpace::new(vm, Arc::new(SoftPmap::new()));
        assert_eq!(child.copy_from(&parent), Err(VmError::OutOfFrames));
        assert!(parent.page_info(0x1000).unwrap().resident);
    }
}
