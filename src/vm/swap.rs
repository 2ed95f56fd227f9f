//! Swap Space Management
//!
//! The swap device is divided into page-sized slots of
//! `PAGE_SIZE / SECTOR_SIZE` consecutive sectors. A bitmap records which
//! slots hold an evicted anonymous page. Each slot is owned by exactly one
//! anonymous page and is released when that page is swapped back in or
//! destroyed.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::drivers::block::{BlockDevice, SECTOR_SIZE};

use super::error::{VmError, VmResult};
use super::PAGE_SIZE;

// ============================================================================
// Constants
// ============================================================================

/// Sectors per swap slot
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

const BITS_PER_BYTE: usize = 8;

// ============================================================================
// Slot Bitmap
// ============================================================================

/// Allocation bitmap over swap slots
#[derive(Debug)]
pub struct SwapBitmap {
    map: Vec<u8>,
    bits: usize,
    used: usize,
    /// Where the next search starts
    cursor: usize,
}

impl SwapBitmap {
    pub fn new(bits: usize) -> Self {
        Self {
            map: vec![0u8; bits.div_ceil(BITS_PER_BYTE)],
            bits,
            used: 0,
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bits
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn test(&self, idx: usize) -> bool {
        idx < self.bits && self.map[idx / BITS_PER_BYTE] & (1 << (idx % BITS_PER_BYTE)) != 0
    }

    /// Find a clear bit, set it and return its index
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        if self.used == self.bits {
            return None;
        }
        for step in 0..self.bits {
            let idx = (self.cursor + step) % self.bits;
            if !self.test(idx) {
                self.map[idx / BITS_PER_BYTE] |= 1 << (idx % BITS_PER_BYTE);
                self.used += 1;
                self.cursor = (idx + 1) % self.bits;
                return Some(idx);
            }
        }
        None
    }

    /// Clear a set bit
    pub fn reset(&mut self, idx: usize) {
        debug_assert!(self.test(idx), "swap slot {} freed twice", idx);
        if self.test(idx) {
            self.map[idx / BITS_PER_BYTE] &= !(1 << (idx % BITS_PER_BYTE));
            self.used -= 1;
        }
    }
}

// ============================================================================
// Swap Table
// ============================================================================

/// An allocated swap slot
///
/// A slot has a single owner and is released through [`SwapTable::free`].
#[derive(Debug, PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    fn first_sector(&self) -> u64 {
        (self.0 * SECTORS_PER_PAGE) as u64
    }
}

/// Swap counters
pub struct SwapStats {
    pub swapped_out: AtomicU64,
    pub swapped_in: AtomicU64,
}

/// Swap device plus its slot bitmap
pub struct SwapTable {
    disk: Arc<dyn BlockDevice>,
    slots: Mutex<SwapBitmap>,
    stats: SwapStats,
}

impl SwapTable {
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let capacity = disk.size() as usize / SECTORS_PER_PAGE;
        log::info!("swap: {} slots on {} sectors", capacity, disk.size());
        Self {
            disk,
            slots: Mutex::new(SwapBitmap::new(capacity)),
            stats: SwapStats {
                swapped_out: AtomicU64::new(0),
                swapped_in: AtomicU64::new(0),
            },
        }
    }

    /// Write a page to a fresh slot
    pub fn swap_out(&self, page: &[u8]) -> VmResult<SwapSlot> {
        let idx = match self.slots.lock().scan_and_flip() {
            Some(idx) => idx,
            None => {
                log::warn!("swap: no free slots");
                return Err(VmError::SwapFull);
            }
        };
        let slot = SwapSlot(idx);

        if let Err(e) = self.write_slot(&slot, page) {
            self.free(slot);
            return Err(e);
        }
        self.stats.swapped_out.fetch_add(1, Ordering::Relaxed);
        log::trace!("swap: out to slot {}", idx);
        Ok(slot)
    }

    /// Read a slot's contents into `page`. The slot stays allocated.
    pub fn swap_in(&self, slot: &SwapSlot, page: &mut [u8]) -> VmResult<()> {
        for (i, chunk) in page.chunks_mut(SECTOR_SIZE).enumerate() {
            self.disk.read(slot.first_sector() + i as u64, chunk)?;
        }
        self.stats.swapped_in.fetch_add(1, Ordering::Relaxed);
        log::trace!("swap: in from slot {}", slot.index());
        Ok(())
    }

    /// Release a slot
    pub fn free(&self, slot: SwapSlot) {
        self.slots.lock().reset(slot.0);
    }

    /// Copy a slot's contents into a fresh slot
    pub fn duplicate(&self, slot: &SwapSlot) -> VmResult<SwapSlot> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.swap_in(slot, &mut buf)?;
        self.swap_out(&buf)
    }

    fn write_slot(&self, slot: &SwapSlot, page: &[u8]) -> VmResult<()> {
        for (i, chunk) in page.chunks(SECTOR_SIZE).enumerate() {
            self.disk.write(slot.first_sector() + i as u64, chunk)?;
        }
        Ok(())
    }

    /// Slots in use
    pub fn used(&self) -> usize {
        self.slots.lock().used()
    }

    /// Total slots on the device
    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity()
    }

    pub fn stats(&self) -> &SwapStats {
        &self.stats
    }
}
