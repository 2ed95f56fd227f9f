//! Frame Table - Physical Frame Management and Eviction
//!
//! Every user frame handed out by the pool is registered here in allocation
//! order. When the pool runs dry, a clock (second-chance) scan over the table
//! picks a victim: frames whose accessed bit is set get the bit cleared and a
//! second chance, the first frame found with the bit already clear is evicted
//! and its physical page reused.
//!
//! ## Locking
//!
//! One lock covers the table and is held from victim selection through
//! eviction to repurposing. Eviction takes the victim's SPT lock, so callers
//! must never enter `get_frame` or `free_frame` while holding an SPT lock.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use super::address_space::AddressSpace;
use super::error::{VmError, VmResult};
use super::palloc::{Kva, UserPool};
use super::PAGE_SIZE;

// ============================================================================
// Frame
// ============================================================================

/// Page a frame currently backs
#[derive(Clone)]
pub struct FrameOwner {
    /// Address space holding the page
    pub space: Weak<AddressSpace>,
    /// User virtual address of the page
    pub va: u64,
}

/// A physical frame backing at most one resident page
pub struct Frame {
    kva: Kva,
    owner: Mutex<Option<FrameOwner>>,
    /// Pin count; pinned frames are never evicted
    pins: AtomicU32,
}

impl Frame {
    /// New frames start pinned and unlinked
    fn new(kva: Kva) -> Self {
        Self {
            kva,
            owner: Mutex::new(None),
            pins: AtomicU32::new(1),
        }
    }

    /// Kernel virtual address of the frame's bytes
    pub fn kva(&self) -> Kva {
        self.kva
    }

    pub fn owner(&self) -> Option<FrameOwner> {
        self.owner.lock().clone()
    }

    /// Record the page this frame backs
    pub fn link(&self, space: Weak<AddressSpace>, va: u64) {
        *self.owner.lock() = Some(FrameOwner { space, va });
    }

    pub fn unlink(&self) {
        *self.owner.lock() = None;
    }

    pub fn is_linked(&self) -> bool {
        self.owner.lock().is_some()
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "unpin of unpinned frame");
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    /// Frame contents
    ///
    /// # Safety
    /// The caller must own the frame's contents for `'a`: the frame is pinned
    /// or its page's SPT lock is held, and no other view of it is live.
    pub unsafe fn bytes<'a>(&self) -> &'a [u8] {
        self.kva.as_slice()
    }

    /// Mutable frame contents
    ///
    /// # Safety
    /// Same as [`Frame::bytes`], and no other reference may exist for `'a`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut<'a>(&self) -> &'a mut [u8] {
        self.kva.as_mut_slice()
    }
}

/// Zero a frame
pub fn zero_frame(kva: Kva) {
    // SAFETY: callers hand in frames they exclusively own
    unsafe {
        core::ptr::write_bytes(kva.as_usize() as *mut u8, 0, PAGE_SIZE);
    }
}

/// Copy one frame's contents to another
pub fn copy_frame(src: Kva, dst: Kva) {
    // SAFETY: both frames are live, distinct and owned by the caller
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_usize() as *const u8,
            dst.as_usize() as *mut u8,
            PAGE_SIZE,
        );
    }
}

// ============================================================================
// Frame Statistics
// ============================================================================

/// Frame table counters
pub struct FrameStats {
    /// Frames taken straight from the pool
    pub allocated: AtomicU64,
    /// Frames obtained by evicting a victim
    pub evicted: AtomicU64,
    /// Accessed bits cleared by the clock hand
    pub second_chances: AtomicU64,
    /// Frames returned to the pool
    pub freed: AtomicU64,
}

impl FrameStats {
    pub const fn new() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            second_chances: AtomicU64::new(0),
            freed: AtomicU64::new(0),
        }
    }

    pub fn evictions(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Frame Table
// ============================================================================

struct FrameTableInner {
    /// Frames in allocation order
    frames: Vec<Arc<Frame>>,
    /// Clock hand: next index to examine
    hand: usize,
}

/// Global registry of user frames
pub struct FrameTable {
    pool: Arc<dyn UserPool>,
    inner: Mutex<FrameTableInner>,
    stats: FrameStats,
}

impl FrameTable {
    pub fn new(pool: Arc<dyn UserPool>) -> Self {
        Self {
            pool,
            inner: Mutex::new(FrameTableInner {
                frames: Vec::new(),
                hand: 0,
            }),
            stats: FrameStats::new(),
        }
    }

    /// Obtain a zeroed frame, evicting a resident page if the pool is empty.
    /// The frame is returned pinned and unlinked.
    pub fn get_frame(&self) -> VmResult<Arc<Frame>> {
        // Address spaces upgraded during the scan are released only after the
        // table lock; dropping the last reference tears the space down, which
        // frees frames through this table.
        let mut held = Vec::new();
        let result = self.get_frame_locked(&mut held);
        drop(held);
        result
    }

    fn get_frame_locked(&self, held: &mut Vec<Arc<AddressSpace>>) -> VmResult<Arc<Frame>> {
        let mut inner = self.inner.lock();

        if let Some(kva) = self.pool.alloc_page() {
            let frame = Arc::new(Frame::new(kva));
            inner.frames.push(frame.clone());
            self.stats.allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        let slot = self.evict(&mut inner, held)?;
        let kva = inner.frames[slot].kva();
        zero_frame(kva);
        let frame = Arc::new(Frame::new(kva));
        inner.frames[slot] = frame.clone();
        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
        log::trace!("frame: reused {:#x} at slot {}", kva.as_usize(), slot);
        Ok(frame)
    }

    /// Clock scan. Returns the table index of a frame whose page has been
    /// evicted. Examines at most two full passes of the table.
    fn evict(
        &self,
        inner: &mut FrameTableInner,
        held: &mut Vec<Arc<AddressSpace>>,
    ) -> VmResult<usize> {
        let len = inner.frames.len();
        let mut last_err = None;

        for _ in 0..2 * len {
            let idx = inner.hand % len;
            inner.hand = (idx + 1) % len;
            let frame = &inner.frames[idx];

            if frame.is_pinned() {
                continue;
            }
            let Some(owner) = frame.owner() else {
                continue;
            };
            // Owner mid-teardown; it frees its own frames
            let Some(space) = owner.space.upgrade() else {
                continue;
            };

            let pmap = space.pmap();
            if pmap.is_accessed(owner.va) {
                pmap.set_accessed(owner.va, false);
                self.stats.second_chances.fetch_add(1, Ordering::Relaxed);
                held.push(space);
                continue;
            }

            let evicted = space.evict_page(owner.va, frame);
            held.push(space);
            match evicted {
                Ok(true) => {
                    frame.unlink();
                    log::trace!("frame: evicted va {:#x}", owner.va);
                    return Ok(idx);
                }
                Ok(false) => continue,
                Err(e) => {
                    log::warn!("frame: eviction of va {:#x} failed: {}", owner.va, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(VmError::OutOfFrames))
    }

    /// Remove `frame` from the table and return its page to the pool
    pub fn free_frame(&self, frame: &Arc<Frame>) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.frames.iter().position(|f| Arc::ptr_eq(f, frame)) else {
            log::warn!("frame: free of unregistered frame {:#x}", frame.kva().as_usize());
            return;
        };
        inner.frames.remove(idx);
        if inner.hand > idx {
            inner.hand -= 1;
        }
        if inner.hand >= inner.frames.len() {
            inner.hand = 0;
        }
        frame.unlink();
        self.pool.free_page(frame.kva());
        self.stats.freed.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of registered frames
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::palloc::HeapPool;

    #[test]
    fn test_get_frame_from_pool() {
        let table = FrameTable::new(Arc::new(HeapPool::new(4)));
        let frame = table.get_frame().unwrap();
        assert!(frame.is_pinned());
        assert!(!frame.is_linked());
        assert_eq!(table.len(), 1);
        assert!(unsafe { frame.bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_all_pinned_fails() {
        let table = FrameTable::new(Arc::new(HeapPool::new(2)));
        let _a = table.get_frame().unwrap();
        let _b = table.get_frame().unwrap();
        assert_eq!(table.get_frame().err(), Some(VmError::OutOfFrames));
    }

    #[test]
    fn test_unlinked_frames_are_not_victims() {
        let table = FrameTable::new(Arc::new(HeapPool::new(1)));
        let frame = table.get_frame().unwrap();
        frame.unpin();
        assert_eq!(table.get_frame().err(), Some(VmError::OutOfFrames));
    }

    #[test]
    fn test_pin_count() {
        let table = FrameTable::new(Arc::new(HeapPool::new(1)));
        let frame = table.get_frame().unwrap();
        frame.pin();
        frame.unpin();
        assert!(frame.is_pinned());
        frame.unpin();
        assert!(!frame.is_pinned());
    }

    #[test]
    fn test_free_frame_returns_to_pool() {
        let pool = Arc::new(HeapPool::new(1));
        let table = FrameTable::new(pool.clone());
        let frame = table.get_frame().unwrap();
        table.free_frame(&frame);
        assert_eq!(pool.in_use(), 0);
        assert!(table.is_empty());
        assert!(table.get_frame().is_ok());
    }

    #[test]
    fn test_zero_and_copy() {
        let pool = HeapPool::new(2);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        unsafe { a.as_mut_slice() }.fill(0x5a);
        copy_frame(a, b);
        assert!(unsafe { b.as_slice() }.iter().all(|&x| x == 0x5a));
        zero_frame(b);
        assert!(unsafe { b.as_slice() }.iter().all(|&x| x == 0));
    }
}
