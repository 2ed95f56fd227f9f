//! Error types for the VM core

use thiserror::Error;

use crate::drivers::block::BlockError;
use crate::vm::pmap::PmapError;

/// Errors reported by page, frame, swap and address-space operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("address {0:#x} is already mapped")]
    AlreadyMapped(u64),

    #[error("no page at {0:#x}")]
    NotMapped(u64),

    #[error("page at {0:#x} is not resident")]
    NotResident(u64),

    #[error("address {0:#x} is not page-aligned")]
    Misaligned(u64),

    #[error("invalid argument")]
    InvalidArgument,

    #[error("out of physical frames")]
    OutOfFrames,

    #[error("swap space exhausted")]
    SwapFull,

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("short write: expected {expected} bytes, got {actual}")]
    ShortWrite { expected: usize, actual: usize },

    #[error("swap device error: {0}")]
    Device(#[from] BlockError),

    #[error("page table update failed: {0}")]
    Pmap(#[from] PmapError),
}

impl VmError {
    /// Whether the error reflects memory or swap exhaustion rather than I/O
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::OutOfFrames | Self::SwapFull | Self::Pmap(PmapError::OutOfMemory))
    }
}

/// Result alias used throughout the VM core
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_display() {
        assert_eq!(VmError::AlreadyMapped(0x1000).to_string(), "address 0x1000 is already mapped");
        let short = VmError::ShortRead { expected: 10, actual: 3 };
        assert_eq!(short.to_string(), "short read: expected 10 bytes, got 3");
    }

    #[test]
    fn test_error_conversion() {
        let err: VmError = BlockError::OutOfRange(99).into();
        assert_eq!(err, VmError::Device(BlockError::OutOfRange(99)));
        assert!(!err.is_exhaustion());
        assert!(VmError::SwapFull.is_exhaustion());
    }
}
