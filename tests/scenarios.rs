//! End-to-end scenarios that cross module boundaries: a page swapped out
//! and faulted back in, and a memory-mapped file written through the
//! address space and evicted to disk. Individual unit tests exercise each
//! module in isolation; these exercise the wiring between them.

use std::sync::Arc;

use vmfs_core::block_device::MemoryBlockDevice;
use vmfs_core::error::VmError;
use vmfs_core::fs::FileSystem;
use vmfs_core::param::{PAGE_SECTOR_COUNT, PGSIZE};
use vmfs_core::swap::SwapArea;
use vmfs_core::vm::{mmap_file_create, mmap_file_destroy, AddressSpace, FrameTable, HashedAddressSpace, Spt, SptType, VirtAddr};

fn new_fs() -> Arc<FileSystem<MemoryBlockDevice>> {
    let dev = Arc::new(MemoryBlockDevice::with_reference_geometry(1024));
    Arc::new(FileSystem::format(dev, 32))
}

fn new_swap(pages: usize) -> SwapArea<MemoryBlockDevice> {
    let dev = MemoryBlockDevice::with_reference_geometry(pages * PAGE_SECTOR_COUNT);
    SwapArea::new(dev, PAGE_SECTOR_COUNT)
}

/// A faulted-in anonymous page survives a swap-out/fault-back-in round
/// trip with its contents intact.
#[test]
fn anonymous_page_survives_swap_round_trip() {
    let fs = new_fs();
    let frame_table = FrameTable::new(4);
    let swap = new_swap(4);
    let address_space = HashedAddressSpace::new();
    let spt: Spt<MemoryBlockDevice> = Spt::new(VirtAddr::new(0));

    let uvaddr = VirtAddr::new(PGSIZE);
    let sp = VirtAddr::new(PGSIZE + 16);

    // First touch: no entry yet, but it's within stack-growth slack of sp.
    spt.handle_fault(&address_space, &frame_table, &swap, uvaddr, sp, &fs).unwrap();
    let entry = spt.lookup(uvaddr).unwrap();
    assert_eq!(entry.ty(), SptType::Zero);

    // Write a recognizable byte through the installed mapping.
    address_space.touch_write(uvaddr, 0, 0xCD);
    assert_eq!(address_space.read_page(uvaddr)[0], 0xCD);

    entry.swap_out(&frame_table, &address_space, &swap);
    assert_eq!(frame_table.len(), 0);

    // Faulting the same address again finds the entry Swapped and brings
    // it back in-place.
    spt.handle_fault(&address_space, &frame_table, &swap, uvaddr, sp, &fs).unwrap();
    assert_eq!(frame_table.len(), 1);
    assert_eq!(address_space.read_page(uvaddr)[0], 0xCD);

    spt.destroy_all(&frame_table, &address_space, &swap);
}

/// A dirty mmap page, evicted under memory pressure, is written back to
/// its backing file rather than sent to swap, and the write is visible
/// through the file system once the frame is reclaimed.
#[test]
fn mmap_eviction_writes_dirty_page_back_to_file() {
    let fs = new_fs();
    let frame_table = FrameTable::new(1);
    let swap = new_swap(4);
    let address_space = HashedAddressSpace::new();
    let spt: Spt<MemoryBlockDevice> = Spt::new(VirtAddr::new(0));

    let file = fs.create(fs.root_sector(), "/mapped").unwrap();
    fs.write_at(&file, &vec![0u8; PGSIZE], 0).unwrap();

    let base = VirtAddr::new(4 * PGSIZE);
    let mapping = mmap_file_create(&fs, &spt, file, base).unwrap();
    assert_eq!(mapping.page_count(), 1);

    // Fault it in, dirty one byte through the mapping, then evict it --
    // the frame table has capacity 1, so this is the only victim.
    spt.handle_fault(&address_space, &frame_table, &swap, base, VirtAddr::new(0), &fs)
        .unwrap();
    address_space.touch_write(base, 0, 0xAB);

    let entry = spt.lookup(base).unwrap();
    assert!(entry.is_dirty(&address_space));

    frame_table.evict_one(&address_space, &swap).unwrap();

    let reopened = fs.open_path(fs.root_sector(), "/mapped").unwrap();
    let mut out = vec![0u8; PGSIZE];
    let n = fs.read_at(&reopened, &mut out, 0);
    assert_eq!(n, PGSIZE);
    assert_eq!(out[0], 0xAB);
    assert_eq!(&out[1..], vec![0u8; PGSIZE - 1].as_slice());
    fs.close(reopened);

    mmap_file_destroy(&fs, &spt, &frame_table, &address_space, &swap, mapping);
}

/// Faulting again on a page that is already resident is a caller bug, not
/// a no-op.
#[test]
fn fault_on_already_loaded_page_fails() {
    let fs = new_fs();
    let frame_table = FrameTable::new(4);
    let swap = new_swap(4);
    let address_space = HashedAddressSpace::new();
    let spt: Spt<MemoryBlockDevice> = Spt::new(VirtAddr::new(0));

    let uvaddr = VirtAddr::new(PGSIZE);
    let sp = VirtAddr::new(PGSIZE + 16);

    spt.handle_fault(&address_space, &frame_table, &swap, uvaddr, sp, &fs).unwrap();
    let err = spt
        .handle_fault(&address_space, &frame_table, &swap, uvaddr, sp, &fs)
        .unwrap_err();
    assert_eq!(err, VmError::BadAddress);

    spt.destroy_all(&frame_table, &address_space, &swap);
}
