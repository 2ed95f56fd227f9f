//! File-backed pages
//!
//! Pages whose contents come from a file region. Eviction writes them back
//! only when the hardware dirty bit says they were modified; write-back
//! never extends the file. The page-cache flavour reads a whole page (or up
//! to end of file) instead of a fixed byte count.

use super::error::{VmError, VmResult};
use super::page::PendingLoad;
use super::PAGE_SIZE;

/// File-backed page state
#[derive(Debug)]
pub struct FilePage {
    load: PendingLoad,
}

impl FilePage {
    pub fn new(load: PendingLoad) -> Self {
        Self { load }
    }

    /// File region this page mirrors
    pub fn load(&self) -> &PendingLoad {
        &self.load
    }

    /// Read `read_bytes` from the file, zero the rest
    pub fn swap_in(&mut self, frame: &mut [u8]) -> VmResult<()> {
        self.load.read_into(frame)
    }

    /// Read as much of the page as the file holds and zero the tail. The
    /// region's geometry is updated to what was actually read.
    pub fn readahead(&mut self, frame: &mut [u8]) -> VmResult<()> {
        let n = self.load.file.read_at(&mut frame[..PAGE_SIZE], self.load.offset);
        frame[n..].fill(0);
        self.load.read_bytes = n;
        self.load.zero_bytes = PAGE_SIZE - n;
        Ok(())
    }

    /// Write the file-backed part of `frame` to the file
    pub fn write_back(&self, frame: &[u8]) -> VmResult<()> {
        let expected = self.load.read_bytes;
        let actual = self.load.file.write_at(&frame[..expected], self.load.offset);
        if actual != expected {
            return Err(VmError::ShortWrite { expected, actual });
        }
        log::trace!("file: wrote back {} bytes at offset {}", actual, self.load.offset);
        Ok(())
    }

    /// Same region over a reopened handle
    pub fn duplicate(&self) -> Self {
        Self {
            load: self.load.duplicate(),
        }
    }
}
