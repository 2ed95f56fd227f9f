//! Physical Map (pmap) - Hardware Page Table Interface
//!
//! The pmap installs and removes translations from user virtual pages to
//! frames, and exposes the accessed/dirty bits the MMU maintains. The VM core
//! sees it only through the [`Pmap`] trait.
//!
//! [`SoftPmap`] is a software page table for hosted runs: it keeps the
//! translations in a map and emulates the MMU's accessed/dirty bookkeeping
//! when user accesses go through [`SoftPmap::read`] and [`SoftPmap::write`].

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;
use thiserror::Error;

use super::palloc::Kva;
use super::{pg_ofs, trunc_page, PAGE_SIZE};

// ============================================================================
// Pmap Interface
// ============================================================================

/// Page table update errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapError {
    #[error("translation already present")]
    AlreadyMapped,

    #[error("no translation present")]
    NotMapped,

    #[error("out of memory for page tables")]
    OutOfMemory,
}

/// Per-address-space hardware page table
///
/// All addresses are user virtual page addresses (page-aligned).
pub trait Pmap: Send + Sync {
    /// Install `va -> kva`
    fn map(&self, va: u64, kva: Kva, writable: bool) -> Result<(), PmapError>;

    /// Remove the translation for `va`; later accesses fault as not-present.
    /// Returns the dirty bit the translation carried at removal.
    fn unmap(&self, va: u64) -> bool;

    /// Frame currently mapped at `va`
    fn translate(&self, va: u64) -> Option<Kva>;

    /// Whether the translation at `va` allows writes
    fn is_writable(&self, va: u64) -> bool;

    fn is_dirty(&self, va: u64) -> bool;
    fn set_dirty(&self, va: u64, dirty: bool);

    fn is_accessed(&self, va: u64) -> bool;
    fn set_accessed(&self, va: u64, accessed: bool);
}

// ============================================================================
// Software Page Table
// ============================================================================

/// Page table entry
#[derive(Debug, Clone, Copy)]
struct Pte {
    kva: Kva,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A user access the MMU refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFault {
    /// Faulting address
    pub addr: u64,
    /// The access was a write
    pub write: bool,
    /// No translation was present (false means a protection violation)
    pub not_present: bool,
}

/// Map-backed page table emulating the MMU
pub struct SoftPmap {
    entries: Mutex<BTreeMap<u64, Pte>>,
    failing: AtomicBool,
}

impl SoftPmap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make subsequent `map` calls fail as if page-table memory ran out
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of installed translations
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Perform a user access within one page, updating accessed/dirty bits.
    /// The translation lock is held across the copy so eviction cannot
    /// unmap the frame mid-access.
    fn access<R>(
        &self,
        addr: u64,
        write: bool,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, AccessFault> {
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&trunc_page(addr)) else {
            return Err(AccessFault { addr, write, not_present: true });
        };
        if write && !pte.writable {
            return Err(AccessFault { addr, write, not_present: false });
        }
        pte.accessed = true;
        if write {
            pte.dirty = true;
        }
        // SAFETY: a mapped frame stays live while its translation exists,
        // and the entries lock serializes user accesses through this pmap
        let frame = unsafe { pte.kva.as_mut_slice() };
        Ok(f(frame))
    }

    /// User read of `buf.len()` bytes at `addr`; must not cross a page boundary
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), AccessFault> {
        let ofs = pg_ofs(addr);
        debug_assert!(ofs + buf.len() <= PAGE_SIZE);
        self.access(addr, false, |frame| {
            buf.copy_from_slice(&frame[ofs..ofs + buf.len()]);
        })
    }

    /// User write of `data` at `addr`; must not cross a page boundary
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), AccessFault> {
        let ofs = pg_ofs(addr);
        debug_assert!(ofs + data.len() <= PAGE_SIZE);
        self.access(addr, true, |frame| {
            frame[ofs..ofs + data.len()].copy_from_slice(data);
        })
    }
}

impl Default for SoftPmap {
    fn default() -> Self {
        Self::new()
    }
}

impl Pmap for SoftPmap {
    fn map(&self, va: u64, kva: Kva, writable: bool) -> Result<(), PmapError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PmapError::OutOfMemory);
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&va) {
            return Err(PmapError::AlreadyMapped);
        }
        entries.insert(va, Pte { kva, writable, accessed: false, dirty: false });
        Ok(())
    }

    fn unmap(&self, va: u64) -> bool {
        self.entries.lock().remove(&va).is_some_and(|pte| pte.dirty)
    }

    fn translate(&self, va: u64) -> Option<Kva> {
        self.entries.lock().get(&va).map(|pte| pte.kva)
    }

    fn is_writable(&self, va: u64) -> bool {
        self.entries.lock().get(&va).is_some_and(|pte| pte.writable)
    }

    fn is_dirty(&self, va: u64) -> bool {
        self.entries.lock().get(&va).is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&self, va: u64, dirty: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&va) {
            pte.dirty = dirty;
        }
    }

    fn is_accessed(&self, va: u64) -> bool {
        self.entries.lock().get(&va).is_some_and(|pte| pte.accessed)
    }

    fn set_accessed(&self, va: u64, accessed: bool) {
        if let Some(pte) = self.entries.lock().get_mut(&va) {
            pte.accessed = accessed;
        }
    }
}
