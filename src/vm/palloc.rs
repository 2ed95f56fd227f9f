//! User Page Pool
//!
//! Source of physical frames for user pages. Frames are handed out as kernel
//! virtual addresses of page-sized, page-aligned, zero-filled buffers.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeSet;

use spin::Mutex;

use super::PAGE_SIZE;

// ============================================================================
// Kernel Virtual Address
// ============================================================================

/// Kernel virtual address of a page-sized frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kva(pub usize);

impl Kva {
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// View the frame as bytes
    ///
    /// # Safety
    /// The frame must be live (allocated from a pool and not yet freed) and
    /// no mutable view of it may exist for `'a`.
    pub unsafe fn as_slice<'a>(self) -> &'a [u8] {
        core::slice::from_raw_parts(self.0 as *const u8, PAGE_SIZE)
    }

    /// View the frame as mutable bytes
    ///
    /// # Safety
    /// The frame must be live and the caller must be its only accessor for `'a`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(self) -> &'a mut [u8] {
        core::slice::from_raw_parts_mut(self.0 as *mut u8, PAGE_SIZE)
    }
}

// ============================================================================
// Pool Interface
// ============================================================================

/// Allocator for user frames
pub trait UserPool: Send + Sync {
    /// Allocate one zero-filled frame, or `None` when the pool is exhausted
    fn alloc_page(&self) -> Option<Kva>;

    /// Return a frame obtained from `alloc_page`
    fn free_page(&self, kva: Kva);
}

// ============================================================================
// Heap-backed Pool
// ============================================================================

/// Fixed-capacity pool carved out of the kernel heap
pub struct HeapPool {
    capacity: usize,
    allocated: Mutex<BTreeSet<usize>>,
}

impl HeapPool {
    /// Create a pool that hands out at most `capacity` frames at once
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Maximum number of live frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently handed out
    pub fn in_use(&self) -> usize {
        self.allocated.lock().len()
    }

    fn layout() -> Option<Layout> {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).ok()
    }
}

impl UserPool for HeapPool {
    fn alloc_page(&self) -> Option<Kva> {
        let mut allocated = self.allocated.lock();
        if allocated.len() >= self.capacity {
            return None;
        }
        let layout = Self::layout()?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        allocated.insert(ptr as usize);
        Some(Kva(ptr as usize))
    }

    fn free_page(&self, kva: Kva) {
        let mut allocated = self.allocated.lock();
        if !allocated.remove(&kva.0) {
            log::warn!("palloc: free of unknown frame {:#x}", kva.0);
            return;
        }
        if let Some(layout) = Self::layout() {
            // SAFETY: the address came from alloc_zeroed with this layout
            unsafe { dealloc(kva.0 as *mut u8, layout) };
        }
    }
}

impl Drop for HeapPool {
    fn drop(&mut self) {
        let Some(layout) = Self::layout() else { return };
        for addr in core::mem::take(&mut *self.allocated.lock()) {
            // SAFETY: every tracked address came from alloc_zeroed with this layout
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}
