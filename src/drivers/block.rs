//! Block device interface and in-memory disk
//!
//! Swap space sits on a sector-addressed block device. The VM core only needs
//! fixed-size sector reads and writes, so that is all the trait offers.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;
use thiserror::Error;

/// Bytes per disk sector
pub const SECTOR_SIZE: usize = 512;

/// Block device errors
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("sector {0} is past the end of the device")]
    OutOfRange(u64),

    #[error("I/O error on sector {0}")]
    Io(u64),

    #[error("buffer is not exactly one sector")]
    BadBuffer,
}

/// A sector-addressed storage device
pub trait BlockDevice: Send + Sync {
    /// Device size in sectors
    fn size(&self) -> u64;

    /// Read one sector into `buf` (exactly `SECTOR_SIZE` bytes)
    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Write one sector from `buf` (exactly `SECTOR_SIZE` bytes)
    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError>;
}

/// RAM-backed block device
///
/// Stands in for the swap partition. Can be told to fail every request so
/// callers can exercise their I/O error paths.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    sectors: u64,
    failing: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl RamDisk {
    /// Create a zero-filled disk of `sectors` sectors
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
            failing: AtomicBool::new(false),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every subsequent request fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of sector reads served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of sector writes served
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self, sector: u64, len: usize) -> Result<usize, BlockError> {
        if len != SECTOR_SIZE {
            return Err(BlockError::BadBuffer);
        }
        if sector >= self.sectors {
            return Err(BlockError::OutOfRange(sector));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(BlockError::Io(sector));
        }
        Ok(sector as usize * SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn size(&self) -> u64 {
        self.sectors
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        let base = self.check(sector, buf.len())?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[base..base + SECTOR_SIZE]);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<(), BlockError> {
        let base = self.check(sector, buf.len())?;
        let mut data = self.data.lock();
        data[base..base + SECTOR_SIZE].copy_from_slice(buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
