//! demand_pager - Demand-paged virtual memory for a teaching kernel
//!
//! This crate provides the VM core of a small x86-64 kernel: lazily
//! populated pages, a global frame table with clock eviction, swap space for
//! anonymous memory, memory-mapped files, stack growth and address-space
//! copy on fork.
//!
//! The hardware page table, user page pool, file system and swap disk are
//! reached through traits, each with a hosted implementation so the whole
//! core can run and be tested off-target (see [`sim`]).

#![cfg_attr(not(test), no_std)]
// Kernel code often needs explicit casts between address widths
#![allow(clippy::unnecessary_cast)]
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod console;
pub mod drivers;
pub mod fs;
pub mod sim;
pub mod vm;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bring up the VM core: console logging at `level`, then the global VM
/// context over the given frame pool and swap disk.
pub fn init(
    level: log::LevelFilter,
    config: vm::VmConfig,
    pool: alloc::sync::Arc<dyn vm::UserPool>,
    swap_disk: alloc::sync::Arc<dyn drivers::BlockDevice>,
) -> &'static alloc::sync::Arc<vm::Vm> {
    console::init(level, None);
    log::info!("demand_pager {}", VERSION);
    vm::vm_init(config, pool, swap_disk)
}
