//! In-memory file

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{File, FileHandle};

/// Contents shared by every handle opened on the same file
struct Inode {
    data: Mutex<Vec<u8>>,
    open_count: AtomicUsize,
}

/// An open handle on a RAM-resident file
pub struct MemFile {
    inode: Arc<Inode>,
}

impl MemFile {
    /// Create a file holding `data` and return the first handle
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inode: Arc::new(Inode {
                data: Mutex::new(data),
                open_count: AtomicUsize::new(1),
            }),
        })
    }

    /// Snapshot of the file contents
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Number of handles currently open on this file
    pub fn open_count(&self) -> usize {
        self.inode.open_count.load(Ordering::SeqCst)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.inode.open_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let data = self.inode.data.lock();
        let len = data.len() as u64;
        if offset >= len {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let mut data = self.inode.data.lock();
        let len = data.len() as u64;
        if offset >= len {
            return 0;
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> FileHandle {
        self.inode.open_count.fetch_add(1, Ordering::SeqCst);
        Arc::new(MemFile { inode: self.inode.clone() })
    }
}
