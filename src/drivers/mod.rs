//! Device drivers used by the VM core
//!
//! Only block storage is needed: the swap area lives on a block device.

pub mod block;

pub use block::{BlockDevice, BlockError, RamDisk, SECTOR_SIZE};
