//! Memory-mapped files.
//!
//! A thin layer over the SPT: a mapping is nothing but a run of `Mmap`
//! entries, one per page, each reading its slice from (and later writing
//! it back to) the same backing inode.

use std::sync::Arc;

use crate::block_device::BlockDevice;
use crate::error::{VmError, VmResult};
use crate::fs::{FileSystem, Inode};
use crate::param::PGSIZE;
use crate::vm::addr::VirtAddr;
use crate::vm::spt::{Spt, SptEntry, SptType};

/// A live memory mapping: the pages it installed and the file handle kept
/// open for its lifetime, with its own cursor and close lifetime
/// independent of any other open handle on the same file.
pub struct Mmap<D: BlockDevice + 'static> {
    file: Inode,
    base: VirtAddr,
    page_count: usize,
}

impl<D: BlockDevice + 'static> Mmap<D> {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }
}

/// Creates a mapping of `file` at `uvaddr`. Fails if `uvaddr`
/// is unaligned or null, or if any page it would occupy is already
/// mapped -- in which case every page inserted so far is unwound.
pub fn mmap_file_create<D: BlockDevice + 'static>(
    fs: &Arc<FileSystem<D>>,
    spt: &Spt<D>,
    file: Inode,
    uvaddr: VirtAddr,
) -> VmResult<Mmap<D>> {
    if uvaddr.is_null() || !uvaddr.is_page_aligned() {
        return Err(VmError::BadAddress);
    }
    let length = fs.length(&file);
    let page_count = (length + PGSIZE - 1) / PGSIZE;

    let mut inserted = Vec::with_capacity(page_count);
    for p in 0..page_count {
        let page_uvaddr = uvaddr.offset(p * PGSIZE);
        let offset = p * PGSIZE;
        let read_bytes = length.saturating_sub(offset).min(PGSIZE);
        let zero_bytes = PGSIZE - read_bytes;
        let entry = SptEntry::file_backed(page_uvaddr, SptType::Mmap, true, fs.clone(), file.sector(), offset, read_bytes, zero_bytes);
        if let Err(e) = spt.insert(entry) {
            for done in &inserted {
                spt.remove(*done);
            }
            return Err(e);
        }
        inserted.push(page_uvaddr);
    }

    Ok(Mmap { file, base: uvaddr, page_count })
}

/// Tears a mapping down: destroys every page's SPT entry
/// (writing back dirty `Mmap` pages along the way) and closes the file.
pub fn mmap_file_destroy<D: BlockDevice + 'static>(
    fs: &Arc<FileSystem<D>>,
    spt: &Spt<D>,
    frame_table: &crate::vm::frame::FrameTable,
    address_space: &impl crate::vm::address_space::AddressSpace,
    swap: &crate::swap::SwapArea<D>,
    mapping: Mmap<D>,
) {
    for p in 0..mapping.page_count {
        let page_uvaddr = mapping.base.offset(p * PGSIZE);
        if let Some(entry) = spt.remove(page_uvaddr) {
            entry.destroy(frame_table, address_space, swap);
        }
    }
    fs.close(mapping.file);
}
