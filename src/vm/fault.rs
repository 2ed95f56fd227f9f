//! VM Fault - Page Fault Resolution
//!
//! Classifies a user page fault and resolves it when the access is legal:
//!
//! - **Lazy load**: the page is in the SPT but not resident; claim a frame
//!   and let the page fill it (zero-fill, swap-in, file read).
//! - **Stack growth**: no page, but the address is just below the stack
//!   pointer and within the stack limit; create an anonymous stack page.
//! - **Reject**: null or kernel address, protection violation, write to a
//!   read-only page, or an address nothing covers. The caller terminates the
//!   process with [`FAULT_EXIT_STATUS`].

use core::sync::atomic::{AtomicU64, Ordering};

use super::address_space::AddressSpace;
use super::error::VmError;
use super::page::{PageFlags, VmType};
use super::trunc_page;

/// Exit status of a process killed by an unresolvable fault
pub const FAULT_EXIT_STATUS: i32 = -1;

// ============================================================================
// Fault Description
// ============================================================================

/// What the trap handler knows about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// Faulting address
    pub addr: u64,
    /// Fault raised in user mode
    pub user: bool,
    /// Faulting access was a write
    pub write: bool,
    /// No translation was present (false: protection violation)
    pub not_present: bool,
    /// User stack pointer at the time of the fault
    pub rsp: u64,
}

/// Result of a page fault operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// Fault handled; retry the access
    Success,
    /// Address not covered by any page and not a stack access
    InvalidAddress,
    /// Access not permitted on this page
    ProtectionFailure,
    /// No frame or swap slot available
    MemoryShortage,
    /// I/O or page-table failure while loading the page
    MemoryError,
}

impl FaultResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FaultResult::Success)
    }
}

impl From<VmError> for FaultResult {
    fn from(err: VmError) -> Self {
        match err {
            VmError::NotMapped(_) => FaultResult::InvalidAddress,
            e if e.is_exhaustion() => FaultResult::MemoryShortage,
            _ => FaultResult::MemoryError,
        }
    }
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Faults resolved
    pub resolved: AtomicU64,
    /// Faults resolved by growing the stack
    pub stack_growth: AtomicU64,
    /// Faults rejected
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            resolved: AtomicU64::new(0),
            stack_growth: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_stack_growth(&self) {
        self.stack_growth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Fault Handler
// ============================================================================

/// Resolve a page fault in `space`
pub fn vm_fault(space: &AddressSpace, info: &FaultInfo) -> FaultResult {
    let stats = space.vm().fault_stats();
    stats.incr_total();

    let result = resolve(space, info);
    if result.is_success() {
        stats.incr_resolved();
    } else {
        stats.incr_failures();
        log::debug!(
            "fault: {:?} at {:#x} ({} {}, {}, rsp {:#x})",
            result,
            info.addr,
            if info.user { "user" } else { "kernel" },
            if info.write { "write" } else { "read" },
            if info.not_present { "not present" } else { "protection" },
            info.rsp,
        );
    }
    result
}

fn resolve(space: &AddressSpace, info: &FaultInfo) -> FaultResult {
    let config = space.config();
    if info.addr == 0 || config.is_kernel_vaddr(info.addr) {
        return FaultResult::InvalidAddress;
    }
    if !info.not_present {
        return FaultResult::ProtectionFailure;
    }

    let lookup = space
        .spt()
        .find(info.addr)
        .map(|page| (page.is_writable(), page.is_resident()));

    match lookup {
        Some((false, _)) if info.write => FaultResult::ProtectionFailure,
        // Another thread brought it in first
        Some((_, true)) => FaultResult::Success,
        Some(_) => match space.claim_page(info.addr) {
            Ok(()) => FaultResult::Success,
            Err(e) => e.into(),
        },
        None if config.allows_stack_growth(info.addr, info.rsp) => grow_stack(space, info.addr),
        None => FaultResult::InvalidAddress,
    }
}

/// Add and claim an anonymous stack page covering `addr`
fn grow_stack(space: &AddressSpace, addr: u64) -> FaultResult {
    let va = trunc_page(addr);
    let flags = PageFlags::WRITABLE.union(PageFlags::STACK);

    // A concurrent fault in the same process may have added the page first
    let inserted = match space.alloc_page_with_flags(VmType::Anon, va, flags, None, None) {
        Ok(()) => true,
        Err(VmError::AlreadyMapped(_)) => false,
        Err(e) => return e.into(),
    };
    if let Err(e) = space.claim_page(va) {
        if inserted {
            if let Err(remove_err) = space.remove_page(va) {
                log::debug!("fault: dropping stack page {:#x} failed: {}", va, remove_err);
            }
        }
        return e.into();
    }

    space.vm().fault_stats().incr_stack_growth();
    log::trace!("fault: stack grown to {:#x}", va);
    FaultResult::Success
}

impl AddressSpace {
    /// Resolve a fault in this address space
    pub fn handle_fault(&self, info: &FaultInfo) -> FaultResult {
        vm_fault(self, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::block::RamDisk;
    use crate::vm::config::{VmConfig, USER_STACK};
    use crate::vm::palloc::HeapPool;
    use crate::vm::pmap::SoftPmap;
    use crate::vm::swap::SECTORS_PER_PAGE;
    use crate::vm::{Vm, PAGE_SIZE};
    use alloc::sync::Arc;

    fn setup() -> Arc<AddressSpace> {
        setup_with_pmap().1
    }

    fn setup_with_pmap() -> (Arc<SoftPmap>, Arc<AddressSpace>) {
        let vm = Vm::new(
            VmConfig::DEFAULT,
            Arc::new(HeapPool::new(8)),
            Arc::new(RamDisk::new(8 * SECTORS_PER_PAGE as u64)),
        );
        let pmap = Arc::new(SoftPmap::new());
        (pmap.clone(), AddressSpace::new(vm, pmap))
    }

    fn fault(addr: u64, write: bool, rsp: u64) -> FaultInfo {
        FaultInfo { addr, user: true, write, not_present: true, rsp }
    }

    #[test]
    fn test_reject_null_and_kernel() {
        let space = setup();
        assert_eq!(vm_fault(&space, &fault(0, false, 0)), FaultResult::InvalidAddress);
        let kernel = VmConfig::DEFAULT.kern_base + 0x1000;
        assert_eq!(vm_fault(&space, &fault(kernel, false, 0)), FaultResult::InvalidAddress);
    }

    #[test]
    fn test_reject_protection_fault() {
        let space = setup();
        space.alloc_page(VmType::Anon, 0x1000, true).unwrap();
        let info = FaultInfo { not_present: false, ..fault(0x1000, true, 0) };
        assert_eq!(vm_fault(&space, &info), FaultResult::ProtectionFailure);
    }

    #[test]
    fn test_write_to_read_only() {
        let space = setup();
        space.alloc_page(VmType::Anon, 0x1000, false).unwrap();
        assert_eq!(vm_fault(&space, &fault(0x1000, true, 0)), FaultResult::ProtectionFailure);
        assert_eq!(vm_fault(&space, &fault(0x1000, false, 0)), FaultResult::Success);
    }

    #[test]
    fn test_lazy_load() {
        let space = setup();
        space.alloc_page(VmType::Anon, 0x1000, true).unwrap();
        assert_eq!(vm_fault(&space, &fault(0x1ff0, true, 0)), FaultResult::Success);
        assert!(space.page_info(0x1000).unwrap().resident);
        // Resolved already
        assert_eq!(vm_fault(&space, &fault(0x1000, true, 0)), FaultResult::Success);
    }

    #[test]
    fn test_stack_growth() {
        let space = setup();
        let rsp = USER_STACK - PAGE_SIZE as u64;
        let addr = rsp - 8;
        assert_eq!(vm_fault(&space, &fault(addr, true, rsp)), FaultResult::Success);

        let info = space.page_info(addr).unwrap();
        assert!(info.stack);
        assert_eq!(space.page_count(), 1);
        assert_eq!(space.vm().fault_stats().stack_growth.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stack_growth_limits() {
        let space = setup();
        let rsp = USER_STACK - PAGE_SIZE as u64;
        assert_eq!(vm_fault(&space, &fault(rsp - 64, true, rsp)), FaultResult::InvalidAddress);

        let limit = VmConfig::DEFAULT.stack_limit();
        assert_eq!(vm_fault(&space, &fault(limit - 8, true, limit)), FaultResult::InvalidAddress);
        assert_eq!(vm_fault(&space, &fault(limit, true, limit)), FaultResult::Success);
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn test_failed_stack_growth_drops_own_page() {
        let (pmap, space) = setup_with_pmap();
        let va = USER_STACK - PAGE_SIZE as u64;
        pmap.set_failing(true);
        assert_ne!(grow_stack(&space, va + 8), FaultResult::Success);
        assert!(space.page_info(va).is_none());
    }

    #[test]
    fn test_failed_stack_growth_keeps_concurrent_page() {
        let (pmap, space) = setup_with_pmap();
        let va = USER_STACK - PAGE_SIZE as u64;
        // Added by a sibling thread's fault just before this one
        let flags = PageFlags::WRITABLE.union(PageFlags::STACK);
        space.alloc_page_with_flags(VmType::Anon, va, flags, None, None).unwrap();

        pmap.set_failing(true);
        assert_ne!(grow_stack(&space, va + 8), FaultResult::Success);
        let info = space.page_info(va).unwrap();
        assert!(info.stack);
        assert!(!info.resident);

        pmap.set_failing(false);
        assert_eq!(grow_stack(&space, va + 8), FaultResult::Success);
        assert!(space.page_info(va).unwrap().resident);
    }

    #[test]
    fn test_fault_stats() {
        let space = setup();
        vm_fault(&space, &fault(0, false, 0));
        let stats = space.vm().fault_stats();
        assert_eq!(stats.total.load(Ordering::Relaxed), 1);
        assert_eq!(stats.failures.load(Ordering::Relaxed), 1);
    }
}
