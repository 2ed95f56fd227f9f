//! Program loading helpers
//!
//! Executable segments are registered as lazy anonymous pages whose
//! initializer reads the segment bytes on first touch. The initial stack
//! page is claimed eagerly.

use crate::fs::FileHandle;

use super::address_space::AddressSpace;
use super::error::{VmError, VmResult};
use super::page::{PageFlags, PendingLoad, VmType};
use super::{pg_ofs, PAGE_SIZE};

/// Register the pages of one loadable segment. `read_bytes` come from `file`
/// at `ofs`, followed by `zero_bytes` of zeros, starting at `upage`.
///
/// # Panics
/// If the geometry is not page-aligned.
pub fn load_segment(
    space: &AddressSpace,
    file: &FileHandle,
    ofs: u64,
    upage: u64,
    read_bytes: usize,
    zero_bytes: usize,
    writable: bool,
) -> VmResult<()> {
    assert_eq!((read_bytes + zero_bytes) % PAGE_SIZE, 0, "segment is not page-sized");
    assert_eq!(pg_ofs(upage), 0, "segment start is not page-aligned");
    assert_eq!(pg_ofs(ofs), 0, "segment offset is not page-aligned");

    let mut ofs = ofs;
    let mut upage = upage;
    let mut read_bytes = read_bytes;
    let mut zero_bytes = zero_bytes;

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_SIZE);
        let page_zero_bytes = PAGE_SIZE - page_read_bytes;

        let aux = PendingLoad::new(file.clone(), ofs, page_read_bytes);
        space.alloc_page_with_initializer(
            VmType::Anon,
            upage,
            writable,
            Some(lazy_load_segment),
            Some(aux),
        )?;

        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PAGE_SIZE as u64;
        ofs += page_read_bytes as u64;
    }
    Ok(())
}

/// Initializer for segment pages: read the recorded bytes, zero the rest
pub fn lazy_load_segment(_va: u64, frame: &mut [u8], aux: Option<&PendingLoad>) -> VmResult<()> {
    aux.ok_or(VmError::InvalidArgument)?.read_into(frame)
}

/// Create the first stack page just below the stack top and make it
/// resident. Returns the initial stack pointer.
pub fn setup_stack(space: &AddressSpace) -> VmResult<u64> {
    let top = space.config().user_stack;
    let va = top - PAGE_SIZE as u64;
    let flags = PageFlags::WRITABLE.union(PageFlags::STACK);

    space.alloc_page_with_flags(VmType::Anon, va, flags, None, None)?;
    if let Err(e) = space.claim_page(va) {
        let _ = space.remove_page(va);
        return Err(e);
    }
    Ok(top)
}
