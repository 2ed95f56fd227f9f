//! File interface for file-backed pages
//!
//! Mapped files and lazily loaded executable segments read through this
//! trait. Each page keeps its own reopened handle so closing the original
//! descriptor never invalidates a mapping.

use alloc::sync::Arc;

pub mod memfile;

pub use memfile::MemFile;

/// Shared handle to an open file
pub type FileHandle = Arc<dyn File>;

/// Positional file I/O
pub trait File: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns bytes read (short at EOF)
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes at `offset`; returns bytes written.
    /// Never extends the file.
    fn write_at(&self, buf: &[u8], offset: u64) -> usize;

    /// Current file length in bytes
    fn length(&self) -> u64;

    /// Open an independent handle to the same file
    fn reopen(&self) -> FileHandle;
}
