//! Integration tests for address-space copy on fork

use demand_pager::fs::{File, FileHandle, MemFile};
use demand_pager::sim::Machine;
use demand_pager::vm::config::USER_STACK;
use demand_pager::vm::loader::load_segment;
use demand_pager::vm::{VmType, PAGE_SIZE};

const PAGE: u64 = PAGE_SIZE as u64;
const BASE: u64 = 0x1000_0000;
const MAP: u64 = 0x2000_0000;

#[test]
fn test_child_is_isolated_from_parent() {
    let machine = Machine::new(8, 8);
    let parent = machine.spawn().unwrap();
    let slot = USER_STACK - 64;
    parent.write(slot, b"parent").unwrap();

    let child = parent.fork().unwrap();
    let mut buf = [0u8; 6];
    child.read(slot, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");

    child.write(slot, b"child!").unwrap();
    parent.read(slot, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");

    parent.write(slot, b"again!").unwrap();
    child.read(slot, &mut buf).unwrap();
    assert_eq!(&buf, b"child!");
    assert_eq!(child.rsp(), parent.rsp());
}

#[test]
fn test_swapped_pages_are_copied() {
    let machine = Machine::new(3, 16);
    let parent = machine.spawn_empty();
    for i in 0..4u64 {
        parent.space().alloc_page(VmType::Anon, BASE + i * PAGE, true).unwrap();
        parent.write_byte(BASE + i * PAGE, 0x30 + i as u8).unwrap();
    }
    let swapped = (0..4u64)
        .filter(|i| parent.space().page_info(BASE + i * PAGE).unwrap().swapped)
        .count();
    assert!(swapped > 0);
    let before = machine.vm().swap().used();

    let child = parent.fork().unwrap();
    assert!(machine.vm().swap().used() >= before + swapped);

    for i in 0..4u64 {
        assert_eq!(child.read_byte(BASE + i * PAGE).unwrap(), 0x30 + i as u8);
    }
    for i in 0..4u64 {
        assert_eq!(parent.read_byte(BASE + i * PAGE).unwrap(), 0x30 + i as u8);
    }

    child.exit();
    parent.exit();
    assert_eq!(machine.vm().swap().used(), 0);
    assert_eq!(machine.pool().in_use(), 0);
}

#[test]
fn test_lazy_pages_stay_lazy() {
    let machine = Machine::new(8, 8);
    let parent = machine.spawn_empty();
    let data: Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 97) as u8).collect();
    let file = MemFile::new(data.clone());
    let handle: FileHandle = file.clone();
    load_segment(parent.space(), &handle, 0, BASE, PAGE_SIZE, 0, false).unwrap();

    let child = parent.fork().unwrap();
    assert_eq!(machine.pool().in_use(), 0);
    assert_eq!(child.space().page_info(BASE).unwrap().vm_type, VmType::Uninit);
    // Ours, shared by the parent's segment, plus the child's reopened copy
    assert_eq!(file.open_count(), 2);

    let mut buf = vec![0u8; PAGE_SIZE];
    child.read(BASE, &mut buf).unwrap();
    assert_eq!(buf, data);
    assert!(!parent.space().page_info(BASE).unwrap().resident);
}

#[test]
fn test_dirty_bit_carries_over() {
    let machine = Machine::new(8, 8);
    let parent = machine.spawn_empty();
    let file = MemFile::new(vec![0u8; PAGE_SIZE]);
    let handle: FileHandle = file.clone();
    parent.mmap(MAP, PAGE, true, &handle, 0).unwrap();
    parent.write_byte(MAP + 5, 0x55).unwrap();

    let child = parent.fork().unwrap();
    assert!(child.space().page_info(MAP).unwrap().resident);
    drop(parent);
    assert_eq!(file.contents()[5], 0x55);
    assert_eq!(file.write_at(&[0], 5), 1);

    // The child's copy is dirty too and goes back on its own unmap
    child.munmap(MAP).unwrap();
    assert_eq!(file.contents()[5], 0x55);
}

#[test]
fn test_regions_are_copied() {
    let machine = Machine::new(8, 8);
    let parent = machine.spawn_empty();
    let file = MemFile::new(vec![4u8; 2 * PAGE_SIZE]);
    let handle: FileHandle = file.clone();
    parent.mmap(MAP, 2 * PAGE, true, &handle, 0).unwrap();

    let child = parent.fork().unwrap();
    assert_eq!(child.read_byte(MAP + PAGE).unwrap(), 4);
    child.write_byte(MAP, 8).unwrap();
    child.munmap(MAP).unwrap();
    assert_eq!(child.space().page_count(), 0);
    assert_eq!(file.contents()[0], 8);

    // Parent's region is untouched
    assert_eq!(parent.space().page_count(), 2);
    assert_eq!(parent.read_byte(MAP).unwrap(), 8);
    parent.munmap(MAP).unwrap();
}

#[test]
fn test_fork_out_of_memory_leaves_parent_intact() {
    let machine = Machine::new(1, 0);
    let parent = machine.spawn().unwrap();
    parent.write_byte(USER_STACK - 1, 0x7f).unwrap();

    // The only frame is the parent's, pinned while it is copied
    assert!(parent.fork().is_err());
    assert_eq!(machine.pool().in_use(), 1);
    assert_eq!(parent.read_byte(USER_STACK - 1).unwrap(), 0x7f);
}
