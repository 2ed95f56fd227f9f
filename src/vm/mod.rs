//! Demand-Paged Virtual Memory
//!
//! Provides the VM core of the kernel:
//! - page / uninit / anon / file: page variants and their load/evict paths
//! - spt: per-address-space supplemental page table
//! - frame: global frame table with clock eviction
//! - swap: swap slot allocation on the swap disk
//! - fault: page-fault resolution including stack growth
//! - mmap / fork / loader: mapped files, address-space copy, lazy segments
//!
//! The frame table and swap table live in a [`Vm`] context created once at
//! boot by [`vm_init`]. The free functions at the bottom of this module are
//! the interface the trap, syscall and process layers call; they act on the
//! current thread's address space.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spin::Once;

use crate::drivers::block::BlockDevice;
use crate::fs::FileHandle;

pub mod address_space;
pub mod anon;
pub mod config;
pub mod error;
pub mod fault;
pub mod file;
pub mod fork;
pub mod frame;
pub mod loader;
pub mod mmap;
pub mod page;
pub mod palloc;
pub mod pmap;
pub mod spt;
pub mod swap;
pub mod uninit;

pub use address_space::AddressSpace;
pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use fault::{vm_fault, FaultInfo, FaultResult, FaultStats, FAULT_EXIT_STATUS};
pub use frame::{Frame, FrameTable};
pub use page::{Page, PageFlags, PageInfo, PendingLoad, VmType};
pub use palloc::{HeapPool, Kva, UserPool};
pub use pmap::{Pmap, PmapError, SoftPmap};
pub use spt::{MappingId, MmapRegion, SupplementalPageTable};
pub use swap::{SwapSlot, SwapTable};
pub use uninit::VmInitializer;

// ============================================================================
// Page Geometry
// ============================================================================

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// Offset of `addr` within its page
pub const fn pg_ofs(addr: u64) -> usize {
    (addr & PAGE_MASK) as usize
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Round address up to page boundary; `None` on overflow
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_MASK) {
        Some(a) => Some(a & !PAGE_MASK),
        None => None,
    }
}

// ============================================================================
// VM Context
// ============================================================================

/// Machine-wide VM state: layout, frame table, swap table and counters
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapTable,
    fault_stats: FaultStats,
}

/// Point-in-time VM counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub frames_in_use: usize,
    pub frames_allocated: u64,
    pub evictions: u64,
    pub swap_used: usize,
    pub swap_capacity: usize,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub faults: u64,
    pub faults_resolved: u64,
    pub stack_growths: u64,
    pub fault_failures: u64,
}

impl Vm {
    pub fn new(
        config: VmConfig,
        pool: Arc<dyn UserPool>,
        swap_disk: Arc<dyn BlockDevice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            frames: FrameTable::new(pool),
            swap: SwapTable::new(swap_disk),
            fault_stats: FaultStats::new(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn fault_stats(&self) -> &FaultStats {
        &self.fault_stats
    }

    pub fn stats(&self) -> VmStats {
        let frames = self.frames.stats();
        let swap = self.swap.stats();
        let faults = &self.fault_stats;
        VmStats {
            frames_in_use: self.frames.len(),
            frames_allocated: frames.allocated.load(Ordering::Relaxed),
            evictions: frames.evictions(),
            swap_used: self.swap.used(),
            swap_capacity: self.swap.capacity(),
            swap_outs: swap.swapped_out.load(Ordering::Relaxed),
            swap_ins: swap.swapped_in.load(Ordering::Relaxed),
            faults: faults.total.load(Ordering::Relaxed),
            faults_resolved: faults.resolved.load(Ordering::Relaxed),
            stack_growths: faults.stack_growth.load(Ordering::Relaxed),
            fault_failures: faults.failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Global Instance
// ============================================================================

/// Hook returning the running thread's address space
pub type CurrentSpaceFn = fn() -> Option<Arc<AddressSpace>>;

static VM: Once<Arc<Vm>> = Once::new();
static CURRENT_SPACE: Once<CurrentSpaceFn> = Once::new();

/// Create the global VM context. Later calls return the first instance.
pub fn vm_init(
    config: VmConfig,
    pool: Arc<dyn UserPool>,
    swap_disk: Arc<dyn BlockDevice>,
) -> &'static Arc<Vm> {
    VM.call_once(|| {
        log::info!(
            "vm: stack top {:#x}, stack max {} KiB, kernel base {:#x}",
            config.user_stack,
            config.stack_max / 1024,
            config.kern_base
        );
        Vm::new(config, pool, swap_disk)
    })
}

/// Global VM context, if initialized
pub fn vm() -> Option<&'static Arc<Vm>> {
    VM.get()
}

/// Install the scheduler's current-address-space lookup
pub fn register_current_space(hook: CurrentSpaceFn) {
    CURRENT_SPACE.call_once(|| hook);
}

/// Address space of the running thread
pub fn current_space() -> Option<Arc<AddressSpace>> {
    CURRENT_SPACE.get().and_then(|hook| hook())
}

// ============================================================================
// Kernel Interface
// ============================================================================

/// Register a lazy page of type `ty` in the current address space
pub fn vm_alloc_page_with_initializer(
    ty: VmType,
    va: u64,
    writable: bool,
    init: Option<VmInitializer>,
    aux: Option<PendingLoad>,
) -> bool {
    current_space()
        .is_some_and(|space| space.alloc_page_with_initializer(ty, va, writable, init, aux).is_ok())
}

pub fn vm_alloc_page(ty: VmType, va: u64, writable: bool) -> bool {
    vm_alloc_page_with_initializer(ty, va, writable, None, None)
}

/// Make the page at `va` resident in the current address space
pub fn vm_claim_page(va: u64) -> bool {
    current_space().is_some_and(|space| space.claim_page(va).is_ok())
}

/// Page-fault entry point. On `false` the caller terminates the process
/// with [`FAULT_EXIT_STATUS`].
pub fn vm_try_handle_fault(addr: u64, user: bool, write: bool, not_present: bool, rsp: u64) -> bool {
    let Some(space) = current_space() else {
        return false;
    };
    let info = FaultInfo { addr, user, write, not_present, rsp };
    vm_fault(&space, &info).is_success()
}

/// Remove and destroy the page at `va`
pub fn vm_dealloc_page(va: u64) -> bool {
    current_space().is_some_and(|space| space.remove_page(va).is_ok())
}

/// Type the page at `va` is or will become
pub fn page_get_type(va: u64) -> Option<VmType> {
    current_space().and_then(|space| space.page_get_type(va))
}

pub fn do_mmap(addr: u64, length: u64, writable: bool, file: &FileHandle, offset: u64) -> Option<u64> {
    current_space().and_then(|space| space.mmap(addr, length, writable, file, offset).ok())
}

pub fn do_munmap(addr: u64) {
    if let Some(space) = current_space() {
        if let Err(e) = space.munmap(addr) {
            log::debug!("munmap: {:#x}: {}", addr, e);
        }
    }
}

/// New empty address space over `pmap`, using the global VM
pub fn supplemental_page_table_init(pmap: Arc<dyn Pmap>) -> Option<Arc<AddressSpace>> {
    vm().map(|vm| AddressSpace::new(vm.clone(), pmap))
}

/// Copy `src` into `dst` for fork
pub fn supplemental_page_table_copy(dst: &AddressSpace, src: &AddressSpace) -> bool {
    dst.copy_from(src).is_ok()
}

/// Destroy every page of `space`
pub fn supplemental_page_table_kill(space: &AddressSpace) {
    space.kill();
}
