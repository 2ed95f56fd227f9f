//! Address Spaces
//!
//! An [`AddressSpace`] pairs a process's hardware page table with its
//! supplemental page table. It owns the page lifecycle operations: lazy
//! allocation, claiming a frame for a page, eviction on behalf of the frame
//! table, removal and teardown.
//!
//! ## Locking
//!
//! The SPT lock ranks below the frame-table lock. Frames are obtained before
//! the SPT lock is taken and released after it is dropped.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::config::VmConfig;
use super::error::{VmError, VmResult};
use super::frame::Frame;
use super::page::{Page, PageFlags, PageInfo, PendingLoad, VmType};
use super::palloc::Kva;
use super::pmap::Pmap;
use super::spt::SupplementalPageTable;
use super::uninit::VmInitializer;
use super::{pg_ofs, trunc_page, Vm};

/// A process's virtual memory
pub struct AddressSpace {
    vm: Arc<Vm>,
    pmap: Arc<dyn Pmap>,
    spt: Mutex<SupplementalPageTable>,
    this: Weak<AddressSpace>,
}

impl AddressSpace {
    /// Create an empty address space over `pmap`
    pub fn new(vm: Arc<Vm>, pmap: Arc<dyn Pmap>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            vm,
            pmap,
            spt: Mutex::new(SupplementalPageTable::new()),
            this: this.clone(),
        })
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn config(&self) -> &VmConfig {
        self.vm.config()
    }

    pub fn pmap(&self) -> &dyn Pmap {
        &*self.pmap
    }

    pub(crate) fn spt(&self) -> MutexGuard<'_, SupplementalPageTable> {
        self.spt.lock()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Register a lazy page of type `ty` at `va`. No frame is allocated.
    ///
    /// # Panics
    /// If `ty` is `VmType::Uninit`.
    pub fn alloc_page_with_initializer(
        &self,
        ty: VmType,
        va: u64,
        writable: bool,
        init: Option<VmInitializer>,
        aux: Option<PendingLoad>,
    ) -> VmResult<()> {
        self.alloc_page_with_flags(ty, va, PageFlags::writable(writable), init, aux)
    }

    /// Register a lazy page with no initializer
    pub fn alloc_page(&self, ty: VmType, va: u64, writable: bool) -> VmResult<()> {
        self.alloc_page_with_initializer(ty, va, writable, None, None)
    }

    pub(crate) fn alloc_page_with_flags(
        &self,
        ty: VmType,
        va: u64,
        flags: PageFlags,
        init: Option<VmInitializer>,
        aux: Option<PendingLoad>,
    ) -> VmResult<()> {
        if pg_ofs(va) != 0 {
            return Err(VmError::Misaligned(va));
        }
        let mut spt = self.spt.lock();
        if spt.contains(va) {
            return Err(VmError::AlreadyMapped(va));
        }
        let inserted = spt.insert(Page::new(va, ty, flags, init, aux));
        debug_assert!(inserted.is_ok());
        log::trace!("vm: alloc {:?} page at {:#x}", ty, va);
        Ok(())
    }

    // ========================================================================
    // Residency
    // ========================================================================

    /// Make the page containing `va` resident and mapped
    pub fn claim_page(&self, va: u64) -> VmResult<()> {
        {
            let spt = self.spt.lock();
            let page = spt.find(va).ok_or(VmError::NotMapped(va))?;
            if page.is_resident() {
                return Ok(());
            }
        }

        let frame = self.vm.frames().get_frame()?;
        match self.install(va, &frame) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.vm.frames().free_frame(&frame);
                Ok(())
            }
            Err(e) => {
                self.vm.frames().free_frame(&frame);
                Err(e)
            }
        }
    }

    /// Fill `frame` for the page at `va`, then map and attach it. Returns
    /// false if the page became resident meanwhile. No translation exists
    /// until the frame is filled.
    fn install(&self, va: u64, frame: &Arc<Frame>) -> VmResult<bool> {
        let mut spt = self.spt.lock();
        let page = spt.find_mut(va).ok_or(VmError::NotMapped(va))?;
        if page.is_resident() {
            return Ok(false);
        }
        let upage = page.va();

        let kind = page.materialize(frame, self.vm.swap()).inspect_err(|e| {
            log::debug!("vm: materialize of {:#x} failed: {}", upage, e);
        })?;
        // On failure the page is unchanged and keeps any swap slot
        self.pmap.map(upage, frame.kva(), page.is_writable())?;

        page.attach(frame.clone(), kind, self.vm.swap());
        frame.link(self.this.clone(), upage);
        frame.unpin();
        Ok(true)
    }

    /// Attach an already filled frame to the non-resident page at `va`.
    /// `dirty` seeds the hardware dirty bit. The frame is unpinned on success.
    pub(crate) fn install_filled(&self, page: Page, frame: &Arc<Frame>, dirty: bool) -> VmResult<()> {
        let mut spt = self.spt.lock();
        let upage = page.va();
        if spt.contains(upage) {
            return Err(VmError::AlreadyMapped(upage));
        }
        self.pmap.map(upage, frame.kva(), page.is_writable())?;
        if dirty {
            self.pmap.set_dirty(upage, true);
        }

        let mut page = page;
        page.set_frame(Some(frame.clone()));
        let inserted = spt.insert(page);
        debug_assert!(inserted.is_ok());
        frame.link(self.this.clone(), upage);
        frame.unpin();
        Ok(())
    }

    /// Evict the page at `va` if `frame` still backs it. Called by the frame
    /// table with its lock held. Returns false when the frame no longer
    /// matches the page or has been pinned since it was selected.
    pub(crate) fn evict_page(&self, va: u64, frame: &Arc<Frame>) -> VmResult<bool> {
        let mut spt = self.spt.lock();
        let Some(page) = spt.find_mut(va) else {
            return Ok(false);
        };
        match page.frame() {
            Some(current) if Arc::ptr_eq(current, frame) => {}
            _ => return Ok(false),
        }
        if frame.is_pinned() {
            return Ok(false);
        }
        page.evict(&*self.pmap, self.vm.swap())?;
        Ok(true)
    }

    /// Pin the frame backing `va`, if resident
    pub(crate) fn pin_resident(&self, va: u64) -> Option<Arc<Frame>> {
        let spt = self.spt.lock();
        let frame = spt.find(va)?.frame()?.clone();
        frame.pin();
        Some(frame)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Remove the page at `va`, running its type-specific cleanup
    pub fn remove_page(&self, va: u64) -> VmResult<()> {
        let page = self.spt.lock().remove(va).ok_or(VmError::NotMapped(trunc_page(va)))?;
        self.destroy_pages(alloc::vec![page]);
        Ok(())
    }

    /// Destroy every page and return every frame. Idempotent.
    pub fn kill(&self) {
        let pages = self.spt.lock().take_all();
        if !pages.is_empty() {
            log::debug!("vm: tearing down {} pages", pages.len());
        }
        self.destroy_pages(pages);
    }

    /// Destroy detached pages. Must be called without the SPT lock.
    pub(crate) fn destroy_pages(&self, pages: Vec<Page>) {
        for page in pages {
            if let Some(frame) = page.destroy(&*self.pmap, self.vm.swap()) {
                self.vm.frames().free_frame(&frame);
            }
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Frame the hardware currently maps at `va`
    pub fn inspect(&self, va: u64) -> Option<Kva> {
        self.pmap.translate(trunc_page(va))
    }

    /// Snapshot of the page containing `va`
    pub fn page_info(&self, va: u64) -> Option<PageInfo> {
        self.spt.lock().find(va).map(Page::info)
    }

    /// Type the page containing `va` is or will become
    pub fn page_get_type(&self, va: u64) -> Option<VmType> {
        self.spt.lock().find(va).map(Page::page_get_type)
    }

    /// Number of pages in the SPT
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    /// Number of resident pages
    pub fn resident_count(&self) -> usize {
        self.spt.lock().pages().filter(|p| p.is_resident()).count()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.kill();
    }
}
