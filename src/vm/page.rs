//! Virtual Pages
//!
//! A [`Page`] describes one page of user virtual memory: where it lives,
//! whether it is writable, which frame backs it (if resident) and how to
//! bring its contents in and write them out. The type-specific behaviour is
//! carried by [`PageKind`].
//!
//! ## Lifecycle
//!
//! Every page starts `Uninit`, holding the type it will become plus an
//! optional initializer and pending-load descriptor. The first time it
//! becomes resident it turns into its target type. Afterwards it moves
//! between resident and non-resident through `materialize` followed by
//! `attach`, and `evict`. It is finally torn down by `destroy`.

use alloc::sync::Arc;
use core::fmt;

use crate::fs::FileHandle;

use super::anon::AnonPage;
use super::error::{VmError, VmResult};
use super::file::FilePage;
use super::frame::Frame;
use super::pmap::Pmap;
use super::spt::MappingId;
use super::swap::SwapTable;
use super::uninit::{UninitPage, VmInitializer};
use super::PAGE_SIZE;

// ============================================================================
// Page Types
// ============================================================================

/// Page variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Not yet materialized
    Uninit,
    /// Anonymous memory, backed by swap
    Anon,
    /// File-backed, written back to its file
    File,
    /// File-backed, filled by whole-page read-ahead
    PageCache,
}

// ============================================================================
// Page Flags
// ============================================================================

/// Page marker flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u32);

impl PageFlags {
    /// User writes allowed
    pub const WRITABLE: Self = Self(0x0001);
    /// Page belongs to the user stack
    pub const STACK: Self = Self(0x0002);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// `WRITABLE` if `writable`, else empty
    pub const fn writable(writable: bool) -> Self {
        if writable {
            Self::WRITABLE
        } else {
            Self::empty()
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// Pending Load
// ============================================================================

/// Where a lazily loaded page gets its contents: `read_bytes` from `file`
/// at `offset`, then `zero_bytes` of zeros. The two always sum to a page.
#[derive(Clone)]
pub struct PendingLoad {
    pub file: FileHandle,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl PendingLoad {
    pub fn new(file: FileHandle, offset: u64, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_SIZE, "pending load longer than a page");
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        }
    }

    /// Fill `frame`: exactly `read_bytes` from the file, zeros after.
    pub fn read_into(&self, frame: &mut [u8]) -> VmResult<()> {
        let n = self.file.read_at(&mut frame[..self.read_bytes], self.offset);
        if n != self.read_bytes {
            return Err(VmError::ShortRead {
                expected: self.read_bytes,
                actual: n,
            });
        }
        frame[self.read_bytes..].fill(0);
        Ok(())
    }

    /// Same geometry over an independently reopened file handle
    pub fn duplicate(&self) -> Self {
        Self {
            file: self.file.reopen(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish()
    }
}

// ============================================================================
// Page
// ============================================================================

/// Type-specific page state
pub enum PageKind {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
    PageCache(FilePage),
}

impl PageKind {
    pub fn vm_type(&self) -> VmType {
        match self {
            PageKind::Uninit(_) => VmType::Uninit,
            PageKind::Anon(_) => VmType::Anon,
            PageKind::File(_) => VmType::File,
            PageKind::PageCache(_) => VmType::PageCache,
        }
    }
}

/// One page of user virtual memory
pub struct Page {
    va: u64,
    flags: PageFlags,
    frame: Option<Arc<Frame>>,
    kind: PageKind,
    mapping: Option<MappingId>,
}

impl Page {
    /// New lazy page that becomes `target` on first residency
    pub fn new(
        va: u64,
        target: VmType,
        flags: PageFlags,
        init: Option<VmInitializer>,
        aux: Option<PendingLoad>,
    ) -> Self {
        Self::with_kind(va, flags, PageKind::Uninit(UninitPage::new(target, init, aux)))
    }

    pub(crate) fn with_kind(va: u64, flags: PageFlags, kind: PageKind) -> Self {
        debug_assert_eq!(va % PAGE_SIZE as u64, 0);
        Self {
            va,
            flags,
            frame: None,
            kind,
            mapping: None,
        }
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn is_writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(PageFlags::STACK)
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn frame(&self) -> Option<&Arc<Frame>> {
        self.frame.as_ref()
    }

    pub(crate) fn set_frame(&mut self, frame: Option<Arc<Frame>>) {
        self.frame = frame;
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn mapping(&self) -> Option<MappingId> {
        self.mapping
    }

    pub(crate) fn set_mapping(&mut self, mapping: Option<MappingId>) {
        self.mapping = mapping;
    }

    /// Current variant
    pub fn vm_type(&self) -> VmType {
        self.kind.vm_type()
    }

    /// Variant the page is or will become
    pub fn page_get_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(uninit) => uninit.target(),
            kind => kind.vm_type(),
        }
    }

    /// Fill `frame` with this page's contents without changing the page.
    /// For an uninit page the variant it turns into is returned, to be
    /// committed by [`attach`](Self::attach) once the frame is mapped.
    pub fn materialize(&mut self, frame: &Frame, swap: &SwapTable) -> VmResult<Option<PageKind>> {
        // SAFETY: the frame is pinned, unlinked and not yet mapped, so only
        // this page sees it
        let bytes = unsafe { frame.bytes_mut() };

        match &mut self.kind {
            PageKind::Uninit(uninit) => uninit.initialize(self.va, bytes, swap).map(Some),
            PageKind::Anon(anon) => anon.fill(bytes, swap).map(|()| None),
            PageKind::File(file) => file.swap_in(bytes).map(|()| None),
            PageKind::PageCache(file) => file.readahead(bytes).map(|()| None),
        }
    }

    /// Commit a materialized frame once its translation is installed. A swap
    /// slot consumed by the fill is released here.
    pub(crate) fn attach(&mut self, frame: Arc<Frame>, kind: Option<PageKind>, swap: &SwapTable) {
        if let Some(kind) = kind {
            self.kind = kind;
        }
        if let PageKind::Anon(anon) = &mut self.kind {
            anon.release_slot(swap);
        }
        self.frame = Some(frame);
    }

    /// Write the contents out and detach the frame. The translation is
    /// removed first; if writing out fails it is reinstalled with its dirty
    /// bit and the page stays resident.
    pub fn evict(&mut self, pmap: &dyn Pmap, swap: &SwapTable) -> VmResult<()> {
        let frame = self.frame.clone().ok_or(VmError::NotResident(self.va))?;
        let dirty = pmap.unmap(self.va);
        // SAFETY: the translation is gone and the SPT lock is held
        let bytes = unsafe { frame.bytes() };

        let result = match &mut self.kind {
            PageKind::Anon(anon) => anon.swap_out(bytes, swap),
            PageKind::File(file) | PageKind::PageCache(file) => {
                if dirty {
                    file.write_back(bytes)
                } else {
                    Ok(())
                }
            }
            PageKind::Uninit(_) => Err(VmError::NotResident(self.va)),
        };

        if let Err(e) = result {
            if pmap.map(self.va, frame.kva(), self.is_writable()).is_ok() {
                pmap.set_dirty(self.va, dirty);
            }
            return Err(e);
        }

        self.frame = None;
        Ok(())
    }

    /// Tear the page down: remove its translation, write back dirty file
    /// data, release its swap slot. Returns the frame for the caller to free.
    pub fn destroy(self, pmap: &dyn Pmap, swap: &SwapTable) -> Option<Arc<Frame>> {
        let dirty = self.frame.is_some() && pmap.unmap(self.va);

        match self.kind {
            PageKind::Anon(anon) => anon.destroy(swap),
            PageKind::File(file) | PageKind::PageCache(file) => {
                if let (Some(frame), true) = (&self.frame, dirty) {
                    // SAFETY: the page is detached from its SPT and unmapped
                    let bytes = unsafe { frame.bytes() };
                    if let Err(e) = file.write_back(bytes) {
                        log::warn!("page: write-back of va {:#x} failed: {}", self.va, e);
                    }
                }
            }
            PageKind::Uninit(_) => {}
        }

        self.frame
    }

    /// Non-resident copy of this page for another address space: lazy pages
    /// keep their initializer over a reopened file, swapped-out anonymous
    /// pages get their slot duplicated. For resident pages the copy carries
    /// only the metadata; the caller supplies a frame.
    pub fn duplicate(&self, swap: &SwapTable) -> VmResult<Page> {
        let kind = match &self.kind {
            PageKind::Uninit(uninit) => PageKind::Uninit(uninit.duplicate()),
            PageKind::Anon(anon) => PageKind::Anon(anon.duplicate(swap)?),
            PageKind::File(file) => PageKind::File(file.duplicate()),
            PageKind::PageCache(file) => PageKind::PageCache(file.duplicate()),
        };
        let mut page = Page::with_kind(self.va, self.flags, kind);
        page.mapping = self.mapping;
        Ok(page)
    }

    /// Snapshot for inspection
    pub fn info(&self) -> PageInfo {
        let load = match &self.kind {
            PageKind::Uninit(uninit) => uninit.aux(),
            PageKind::File(file) | PageKind::PageCache(file) => Some(file.load()),
            PageKind::Anon(_) => None,
        };
        PageInfo {
            va: self.va,
            vm_type: self.vm_type(),
            target: self.page_get_type(),
            writable: self.is_writable(),
            stack: self.is_stack(),
            resident: self.is_resident(),
            swapped: matches!(&self.kind, PageKind::Anon(anon) if anon.is_swapped()),
            mapping: self.mapping,
            offset: load.map(|l| l.offset),
            read_bytes: load.map(|l| l.read_bytes),
            zero_bytes: load.map(|l| l.zero_bytes),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &format_args!("{:#x}", self.va))
            .field("type", &self.vm_type())
            .field("flags", &self.flags)
            .field("resident", &self.is_resident())
            .finish()
    }
}

/// Read-only snapshot of a page's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub va: u64,
    pub vm_type: VmType,
    /// Type the page is or will become
    pub target: VmType,
    pub writable: bool,
    pub stack: bool,
    pub resident: bool,
    /// Anonymous page whose contents live in a swap slot
    pub swapped: bool,
    pub mapping: Option<MappingId>,
    pub offset: Option<u64>,
    pub read_bytes: Option<usize>,
    pub zero_bytes: Option<usize>,
}
