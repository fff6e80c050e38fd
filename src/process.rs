//! Per-process resources: file descriptors, memory mappings, the current
//! directory, and the child/exit-signaling surface.
//!
//! A process owns a set of dense resource tables behind a lock, each a
//! `Vec` of `Option<T>` slots that doubles when it runs out of room instead
//! of a fixed-size array, since nothing here bounds the number of open fds
//! or mappings up front.

use std::sync::Arc;

use log::info;

use crate::block_device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::fs::{FileSystem, Inode};
use crate::lock::SpinLock;
use crate::vm::{mmap_file_destroy, FrameTable, HashedAddressSpace, Mmap, Spt, VirtAddr};

/// fd 0 and 1 are reserved for stdin/stdout and never occupy a table slot.
const RESERVED_FDS: usize = 2;

/// A dense, doubling table of per-process resources indexed starting at a
/// fixed offset: scans for an empty slot first, and only grows the backing
/// `Vec` when none is free.
struct ResourceTable<T> {
    reserved: usize,
    slots: Vec<Option<T>>,
}

impl<T> ResourceTable<T> {
    fn new(reserved: usize) -> Self {
        Self {
            reserved,
            slots: vec![],
        }
    }

    fn insert(&mut self, value: T) -> usize {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(value);
                return i + self.reserved;
            }
        }
        let id = self.slots.len() + self.reserved;
        let new_capacity = (self.slots.len() * 2).max(4);
        self.slots.resize_with(new_capacity, || None);
        self.slots[id - self.reserved] = Some(value);
        id
    }

    fn remove(&mut self, id: usize) -> Option<T> {
        if id < self.reserved {
            return None;
        }
        self.slots.get_mut(id - self.reserved).and_then(|s| s.take())
    }

    fn iter_take(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.iter_mut().filter_map(|s| s.take())
    }
}

/// Open files, keyed by file descriptor.
pub struct FdTable {
    table: ResourceTable<Inode>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            table: ResourceTable::new(RESERVED_FDS),
        }
    }

    pub fn insert(&mut self, inode: Inode) -> usize {
        self.table.insert(inode)
    }

    pub fn remove(&mut self, fd: usize) -> Option<Inode> {
        self.table.remove(fd)
    }

    pub fn take_all(&mut self) -> Vec<Inode> {
        self.table.iter_take().collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Live memory mappings, keyed by mmap id.
pub struct MmapTable<D: BlockDevice + 'static> {
    table: ResourceTable<Mmap<D>>,
}

impl<D: BlockDevice + 'static> MmapTable<D> {
    pub fn new() -> Self {
        Self {
            table: ResourceTable::new(0),
        }
    }

    pub fn insert(&mut self, mapping: Mmap<D>) -> usize {
        self.table.insert(mapping)
    }

    pub fn remove(&mut self, id: usize) -> Option<Mmap<D>> {
        self.table.remove(id)
    }

    pub fn take_all(&mut self) -> Vec<Mmap<D>> {
        self.table.iter_take().collect()
    }
}

impl<D: BlockDevice + 'static> Default for MmapTable<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// A process's full resource set.
pub struct Process<D: BlockDevice + 'static> {
    pid: u32,
    fs: Arc<FileSystem<D>>,
    fd_table: SpinLock<FdTable>,
    mmap_table: SpinLock<MmapTable<D>>,
    cwd: SpinLock<Inode>,
    /// The running executable, kept open with writes denied for as long
    /// as the process runs.
    executable: SpinLock<Option<Inode>>,
    children: SpinLock<Vec<u32>>,
    pub spt: Spt<D>,
    pub address_space: HashedAddressSpace,
}

impl<D: BlockDevice + 'static> Process<D> {
    pub fn new(pid: u32, fs: Arc<FileSystem<D>>, cwd: Inode, stack_bottom: VirtAddr) -> Self {
        Self {
            pid,
            fs,
            fd_table: SpinLock::new("fd table", FdTable::new()),
            mmap_table: SpinLock::new("mmap table", MmapTable::new()),
            cwd: SpinLock::new("cwd", cwd),
            executable: SpinLock::new("executable", None),
            children: SpinLock::new("children", Vec::new()),
            spt: Spt::new(stack_bottom),
            address_space: HashedAddressSpace::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn add_child(&self, child_pid: u32) {
        self.children.lock().push(child_pid);
    }

    pub fn children(&self) -> Vec<u32> {
        self.children.lock().clone()
    }

    pub fn open_fd(&self, inode: Inode) -> usize {
        self.fd_table.lock().insert(inode)
    }

    /// Opens `path` relative to this process's current directory.
    pub fn open(&self, path: &str) -> FsResult<Inode> {
        self.fs.open_path(self.cwd(), path)
    }

    /// Creates a file at `path` relative to this process's current
    /// directory.
    pub fn create(&self, path: &str) -> FsResult<Inode> {
        self.fs.create(self.cwd(), path)
    }

    /// Creates a directory at `path` relative to this process's current
    /// directory.
    pub fn create_dir(&self, path: &str) -> FsResult<Inode> {
        self.fs.create_dir(self.cwd(), path)
    }

    /// Removes `path` relative to this process's current directory.
    pub fn remove(&self, path: &str) -> FsResult<()> {
        self.fs.remove(self.cwd(), path)
    }

    pub fn close_fd(&self, fd: usize) -> FsResult<()> {
        match self.fd_table.lock().remove(fd) {
            Some(inode) => {
                self.fs.close(inode);
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }

    /// Records `inode` as the running executable and denies writes to it
    /// for as long as the process runs.
    pub fn set_executable(&self, inode: Inode) {
        self.fs.deny_write(&inode);
        let mut slot = self.executable.lock();
        assert!(slot.is_none(), "a process may only set its executable once");
        *slot = Some(inode);
    }

    pub fn insert_mmap(&self, mapping: Mmap<D>) -> usize {
        self.mmap_table.lock().insert(mapping)
    }

    pub fn remove_mmap(
        &self,
        id: usize,
        frame_table: &FrameTable,
        swap: &crate::swap::SwapArea<D>,
    ) -> Option<()> {
        let mapping = self.mmap_table.lock().remove(id)?;
        mmap_file_destroy(&self.fs, &self.spt, frame_table, &self.address_space, swap, mapping);
        Some(())
    }

    pub fn cwd(&self) -> u32 {
        self.cwd.lock().sector()
    }

    pub fn set_cwd(&self, inode: Inode) {
        let mut cwd = self.cwd.lock();
        let previous = std::mem::replace(&mut *cwd, inode);
        self.fs.close(previous);
    }

    /// Tears down every resource this process owns: closes all fds, tears
    /// down all mappings, closes the executable, and releases the SPT.
    pub fn exit(&self, frame_table: &FrameTable, swap: &crate::swap::SwapArea<D>) {
        for inode in self.fd_table.lock().take_all() {
            self.fs.close(inode);
        }
        for mapping in self.mmap_table.lock().take_all() {
            mmap_file_destroy(&self.fs, &self.spt, frame_table, &self.address_space, swap, mapping);
        }
        if let Some(exe) = self.executable.lock().take() {
            self.fs.allow_write(&exe);
            self.fs.close(exe);
        }
        self.spt.destroy_all(frame_table, &self.address_space, swap);
        let cwd = std::mem::replace(&mut *self.cwd.lock(), self.fs.root());
        self.fs.close(cwd);
        info!("process {} exited", self.pid);
    }
}
