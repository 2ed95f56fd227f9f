//! Hosted machine simulation
//!
//! Runs the VM core without hardware: a [`Machine`] bundles a VM context
//! with a heap-backed frame pool and a RAM swap disk, and each [`Process`]
//! has a software page table. Process reads and writes behave like user
//! loads and stores: a refused access raises a page fault through the
//! resolver and is retried; an unresolvable fault kills the process with
//! exit status -1.

use alloc::sync::Arc;

use thiserror::Error;

use crate::drivers::block::RamDisk;
use crate::fs::FileHandle;
use crate::vm::fault::{vm_fault, FaultInfo, FaultResult, FAULT_EXIT_STATUS};
use crate::vm::loader::setup_stack;
use crate::vm::palloc::HeapPool;
use crate::vm::pmap::SoftPmap;
use crate::vm::swap::SECTORS_PER_PAGE;
use crate::vm::{pg_ofs, AddressSpace, Vm, VmConfig, VmResult, PAGE_SIZE};

/// Faults taken on one page before an access is abandoned
const MAX_FAULT_RETRIES: usize = 64;

/// A user access that ended the process
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    #[error("process killed with status {status} by {reason:?} fault at {addr:#x}")]
    Killed {
        status: i32,
        reason: FaultResult,
        addr: u64,
    },

    #[error("access at {0:#x} kept faulting")]
    Livelock(u64),
}

// ============================================================================
// Machine
// ============================================================================

/// One simulated computer
pub struct Machine {
    vm: Arc<Vm>,
    pool: Arc<HeapPool>,
    disk: Arc<RamDisk>,
}

impl Machine {
    /// Machine with `frames` user frames and `swap_slots` pages of swap
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_config(VmConfig::DEFAULT, frames, swap_slots)
    }

    pub fn with_config(config: VmConfig, frames: usize, swap_slots: usize) -> Self {
        let pool = Arc::new(HeapPool::new(frames));
        let disk = Arc::new(RamDisk::new((swap_slots * SECTORS_PER_PAGE) as u64));
        let vm = Vm::new(config, pool.clone(), disk.clone());
        Self { vm, pool, disk }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn pool(&self) -> &Arc<HeapPool> {
        &self.pool
    }

    pub fn disk(&self) -> &Arc<RamDisk> {
        &self.disk
    }

    /// Process with an empty address space
    pub fn spawn_empty(&self) -> Process {
        let pmap = Arc::new(SoftPmap::new());
        let space = AddressSpace::new(self.vm.clone(), pmap.clone());
        Process { space, pmap, rsp: self.vm.config().user_stack }
    }

    /// Process with its initial stack page set up
    pub fn spawn(&self) -> VmResult<Process> {
        let mut process = self.spawn_empty();
        process.rsp = setup_stack(&process.space)?;
        Ok(process)
    }
}

// ============================================================================
// Process
// ============================================================================

/// An access whose last byte lies past `u64::MAX` faults like any other
/// unmappable address
fn check_range(addr: u64, len: usize) -> Result<(), ProcessError> {
    match addr.checked_add((len as u64).saturating_sub(1)) {
        Some(_) => Ok(()),
        None => Err(ProcessError::Killed {
            status: FAULT_EXIT_STATUS,
            reason: FaultResult::InvalidAddress,
            addr,
        }),
    }
}

/// A simulated user process
pub struct Process {
    space: Arc<AddressSpace>,
    pmap: Arc<SoftPmap>,
    rsp: u64,
}

impl Process {
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn pmap(&self) -> &Arc<SoftPmap> {
        &self.pmap
    }

    pub fn rsp(&self) -> u64 {
        self.rsp
    }

    /// Move the stack pointer (as `sub rsp, n` would)
    pub fn set_rsp(&mut self, rsp: u64) {
        self.rsp = rsp;
    }

    /// User-mode load of `buf.len()` bytes at `addr`
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), ProcessError> {
        check_range(addr, buf.len())?;
        let mut done = 0;
        while done < buf.len() {
            let at = addr + done as u64;
            let n = (PAGE_SIZE - pg_ofs(at)).min(buf.len() - done);
            let chunk = &mut buf[done..done + n];
            self.access(at, false, |pmap| pmap.read(at, chunk))?;
            done += n;
        }
        Ok(())
    }

    /// User-mode store of `data` at `addr`
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), ProcessError> {
        check_range(addr, data.len())?;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done as u64;
            let n = (PAGE_SIZE - pg_ofs(at)).min(data.len() - done);
            let chunk = &data[done..done + n];
            self.access(at, true, |pmap| pmap.write(at, chunk))?;
            done += n;
        }
        Ok(())
    }

    pub fn read_byte(&self, addr: u64) -> Result<u8, ProcessError> {
        let mut byte = [0u8; 1];
        self.read(addr, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_byte(&self, addr: u64, value: u8) -> Result<(), ProcessError> {
        self.write(addr, &[value])
    }

    /// Run one single-page access, resolving faults until it goes through
    fn access(
        &self,
        addr: u64,
        write: bool,
        mut op: impl FnMut(&SoftPmap) -> Result<(), crate::vm::pmap::AccessFault>,
    ) -> Result<(), ProcessError> {
        for _ in 0..MAX_FAULT_RETRIES {
            let fault = match op(&self.pmap) {
                Ok(()) => return Ok(()),
                Err(fault) => fault,
            };
            let info = FaultInfo {
                addr: fault.addr,
                user: true,
                write,
                not_present: fault.not_present,
                rsp: self.rsp,
            };
            let result = vm_fault(&self.space, &info);
            if !result.is_success() {
                return Err(ProcessError::Killed {
                    status: FAULT_EXIT_STATUS,
                    reason: result,
                    addr,
                });
            }
        }
        Err(ProcessError::Livelock(addr))
    }

    pub fn mmap(
        &self,
        addr: u64,
        length: u64,
        writable: bool,
        file: &FileHandle,
        offset: u64,
    ) -> VmResult<u64> {
        self.space.mmap(addr, length, writable, file, offset)
    }

    pub fn munmap(&self, addr: u64) -> VmResult<()> {
        self.space.munmap(addr)
    }

    /// Duplicate this process; the child resumes with the same stack pointer
    pub fn fork(&self) -> VmResult<Process> {
        let pmap = Arc::new(SoftPmap::new());
        let space = AddressSpace::new(self.space.vm().clone(), pmap.clone());
        space.copy_from(&self.space)?;
        Ok(Process { space, pmap, rsp: self.rsp })
    }

    /// Terminate, releasing every page
    pub fn exit(self) {
        self.space.kill();
    }
}
