//! The supplemental page table: per-process entries, their state machine,
//! and the page-fault handler.
//!
//! One table per process, keyed by page-aligned address. Each entry walks
//! `NotLoaded -> Loaded -> Swapped -> Loaded -> ...` (or `-> NotLoaded` for
//! an evicted `Mmap` page, which writes back instead of swapping) driven
//! entirely by [`Spt::handle_fault`] and eviction callbacks from the frame
//! table; nothing outside this module flips the state directly.

use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::block_device::BlockDevice;
use crate::error::{VmError, VmResult};
use crate::fs::FileSystem;
use crate::lock::SpinLock;
use crate::param::{PGSIZE, STACK_GROWTH_SLACK};
use crate::swap::SwapArea;
use crate::vm::addr::VirtAddr;
use crate::vm::address_space::AddressSpace;
use crate::vm::frame::{FrameOwner, FrameTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SptState {
    NotLoaded,
    Loaded,
    Swapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SptType {
    Normal,
    Zero,
    Code,
    Mmap,
}

struct FileBacking {
    /// Sector of the inode backing this page, read/written directly
    /// through the file system (the owning mmap or exec-image handle
    /// keeps its own `Inode` open for the lifetime of the mapping).
    sector: u32,
    offset: usize,
    read_bytes: usize,
    zero_bytes: usize,
}

struct Inner {
    state: SptState,
    ty: SptType,
    writable: bool,
    pinned: bool,
    dirty_override: bool,
    swap_slot: Option<usize>,
    file: Option<FileBacking>,
}

/// One SPT entry: the state of a single user page, whether or not it is
/// currently resident.
pub struct SptEntry<D: BlockDevice + 'static> {
    uvaddr: VirtAddr,
    fs: Arc<FileSystem<D>>,
    inner: SpinLock<Inner>,
}

impl<D: BlockDevice + 'static> SptEntry<D> {
    fn new(uvaddr: VirtAddr, ty: SptType, writable: bool, fs: Arc<FileSystem<D>>, file: Option<FileBacking>) -> Arc<Self> {
        Arc::new(Self {
            uvaddr,
            fs,
            inner: SpinLock::new(
                "spt entry",
                Inner {
                    state: SptState::NotLoaded,
                    ty,
                    writable,
                    pinned: false,
                    dirty_override: false,
                    swap_slot: None,
                    file,
                },
            ),
        })
    }

    pub fn anonymous(uvaddr: VirtAddr, ty: SptType, writable: bool, fs: Arc<FileSystem<D>>) -> Arc<Self> {
        assert!(matches!(ty, SptType::Normal | SptType::Zero));
        Self::new(uvaddr, ty, writable, fs, None)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn file_backed(
        uvaddr: VirtAddr,
        ty: SptType,
        writable: bool,
        fs: Arc<FileSystem<D>>,
        sector: u32,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Arc<Self> {
        assert!(matches!(ty, SptType::Code | SptType::Mmap));
        Self::new(
            uvaddr,
            ty,
            writable,
            fs,
            Some(FileBacking {
                sector,
                offset,
                read_bytes,
                zero_bytes,
            }),
        )
    }

    pub fn uvaddr(&self) -> VirtAddr {
        self.uvaddr
    }

    pub fn state(&self) -> SptState {
        self.inner.lock().state
    }

    pub fn ty(&self) -> SptType {
        self.inner.lock().ty
    }

    pub fn set_pinned(&self, pinned: bool) {
        self.inner.lock().pinned = pinned;
    }

    fn build_page(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        let mut page = vec![0u8; PGSIZE];
        if let Some(file) = &inner.file {
            let n = self.fs.read_raw_at(file.sector, &mut page[..file.read_bytes], file.offset);
            debug_assert!(n <= file.read_bytes);
        }
        page
    }

    /// The logical OR of the override flag set by `on_evicted_to_file`
    /// bookkeeping and the mapping's own dirty bit. Meaningful only while
    /// `Loaded`.
    pub fn is_dirty<A: AddressSpace>(&self, address_space: &A) -> bool {
        let inner = self.inner.lock();
        inner.dirty_override || address_space.is_dirty(self.uvaddr)
    }

    pub fn is_accessed<A: AddressSpace>(&self, address_space: &A) -> bool {
        address_space.is_accessed(self.uvaddr)
    }

    /// `NotLoaded -> Loaded`. Allocates a frame (evicting if necessary),
    /// fills it per the entry's type, and installs the mapping.
    pub fn load(self: &Arc<Self>, frame_table: &FrameTable, address_space: &impl AddressSpace, swap: &SwapArea<D>) -> VmResult<()> {
        let writable = {
            let inner = self.inner.lock();
            assert_eq!(inner.state, SptState::NotLoaded, "load of a non-NotLoaded entry");
            inner.writable
        };
        let page = self.build_page();
        let owner: Arc<dyn FrameOwner> = self.clone();
        frame_table.install_with_eviction(address_space, swap, self.uvaddr, owner, &page, writable)?;
        self.inner.lock().state = SptState::Loaded;
        trace!("spt: loaded {:?}", self.uvaddr);
        Ok(())
    }

    /// `Loaded -> NotLoaded`. Writes back first if `Mmap` and dirty.
    pub fn unload<A: AddressSpace>(&self, frame_table: &FrameTable, address_space: &A) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, SptState::Loaded, "unload of a non-Loaded entry");
        if inner.ty == SptType::Mmap && (inner.dirty_override || address_space.is_dirty(self.uvaddr)) {
            let contents = address_space.read_page(self.uvaddr);
            self.write_back(&inner, &contents);
        }
        inner.state = SptState::NotLoaded;
        drop(inner);
        frame_table.uninstall(address_space, self.uvaddr);
    }

    fn write_back(&self, inner: &Inner, contents: &[u8]) {
        let file = inner.file.as_ref().expect("Mmap entry always has a file backing");
        self.fs
            .write_raw_at(file.sector, &contents[..file.read_bytes], file.offset)
            .expect("write-back to a previously-readable region does not grow the file");
    }

    /// `Loaded -> Swapped`. Rejected for `Mmap` or pinned entries by the
    /// caller's own bookkeeping (the frame table never routes a pinned
    /// frame here).
    pub fn swap_out<A: AddressSpace>(&self, frame_table: &FrameTable, address_space: &A, swap: &SwapArea<D>) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, SptState::Loaded, "swap of a non-Loaded entry");
        assert_ne!(inner.ty, SptType::Mmap, "Mmap entries never swap");
        assert!(!inner.pinned, "pinned entries never swap");
        let contents = address_space.read_page(self.uvaddr);
        let mut page = contents;
        page.resize(PGSIZE, 0);
        let slot = swap.install(&page);
        inner.swap_slot = Some(slot);
        inner.state = SptState::Swapped;
        drop(inner);
        frame_table.uninstall(address_space, self.uvaddr);
    }

    /// `Swapped -> Loaded`.
    pub fn unswap(self: &Arc<Self>, frame_table: &FrameTable, address_space: &impl AddressSpace, swap: &SwapArea<D>) -> VmResult<()> {
        let (slot, writable) = {
            let inner = self.inner.lock();
            assert_eq!(inner.state, SptState::Swapped, "unswap of a non-Swapped entry");
            assert_ne!(inner.ty, SptType::Mmap, "Mmap entries never swap");
            (inner.swap_slot.expect("Swapped entry always has a slot"), inner.writable)
        };
        let mut page = vec![0u8; PGSIZE];
        swap.uninstall(slot, &mut page);
        let owner: Arc<dyn FrameOwner> = self.clone();
        frame_table.install_with_eviction(address_space, swap, self.uvaddr, owner, &page, writable)?;
        let mut inner = self.inner.lock();
        inner.swap_slot = None;
        inner.state = SptState::Loaded;
        Ok(())
    }

    /// Tears the entry down from any state: writes back a dirty `Mmap`
    /// page, frees a swap slot, or does nothing for an already-`NotLoaded`
    /// entry. Used both standalone and by [`Spt::destroy_all`]'s
    /// exit-time walk.
    pub fn destroy<A: AddressSpace>(&self, frame_table: &FrameTable, address_space: &A, swap: &SwapArea<D>) {
        let mut inner = self.inner.lock();
        match inner.state {
            SptState::Loaded => {
                if inner.ty == SptType::Mmap && (inner.dirty_override || address_space.is_dirty(self.uvaddr)) {
                    let contents = address_space.read_page(self.uvaddr);
                    self.write_back(&inner, &contents);
                }
                inner.state = SptState::NotLoaded;
                drop(inner);
                frame_table.uninstall(address_space, self.uvaddr);
            }
            SptState::Swapped => {
                let slot = inner.swap_slot.take().expect("Swapped entry always has a slot");
                swap.remove(slot);
            }
            SptState::NotLoaded => {}
        }
    }
}

impl<D: BlockDevice + 'static> FrameOwner for SptEntry<D> {
    fn is_pinned(&self) -> bool {
        self.inner.lock().pinned
    }

    fn is_mmap(&self) -> bool {
        self.inner.lock().ty == SptType::Mmap
    }

    fn on_evicted_to_file(&self, contents: &[u8]) {
        let mut inner = self.inner.lock();
        self.write_back(&inner, contents);
        inner.state = SptState::NotLoaded;
    }

    fn on_evicted_to_swap(&self, slot: usize) {
        let mut inner = self.inner.lock();
        inner.swap_slot = Some(slot);
        inner.state = SptState::Swapped;
    }
}

/// Per-process table of SPT entries, keyed by page-aligned user virtual
/// address.
pub struct Spt<D: BlockDevice + 'static> {
    entries: SpinLock<HashMap<VirtAddr, Arc<SptEntry<D>>>>,
    stack_bottom: VirtAddr,
}

impl<D: BlockDevice + 'static> Spt<D> {
    /// `stack_bottom` is the lowest address the user stack is ever allowed
    /// to grow into.
    pub fn new(stack_bottom: VirtAddr) -> Self {
        Self {
            entries: SpinLock::new("spt", HashMap::new()),
            stack_bottom,
        }
    }

    pub fn lookup(&self, uvaddr: VirtAddr) -> Option<Arc<SptEntry<D>>> {
        self.entries.lock().get(&uvaddr.page_align_down()).cloned()
    }

    /// Inserts a fresh entry. Fails if one already covers this address.
    pub fn insert(&self, entry: Arc<SptEntry<D>>) -> VmResult<()> {
        let uvaddr = entry.uvaddr();
        let mut entries = self.entries.lock();
        if entries.contains_key(&uvaddr) {
            return Err(VmError::BadAddress);
        }
        entries.insert(uvaddr, entry);
        Ok(())
    }

    pub fn remove(&self, uvaddr: VirtAddr) -> Option<Arc<SptEntry<D>>> {
        self.entries.lock().remove(&uvaddr)
    }

    /// The page-fault handler: resolves `fault_addr` to an entry (growing
    /// the stack if the fault falls within its growth slack and no entry
    /// exists yet), then drives it toward `Loaded`. A fault against an
    /// already-`Loaded` page is not demand paging's problem -- the access
    /// that triggered it is a bug in the caller -- so it fails rather than
    /// silently returning success.
    pub fn handle_fault<A: AddressSpace>(
        &self,
        address_space: &A,
        frame_table: &FrameTable,
        swap: &SwapArea<D>,
        fault_addr: VirtAddr,
        user_stack_pointer: VirtAddr,
        fs: &Arc<FileSystem<D>>,
    ) -> VmResult<()> {
        if fault_addr.is_null() {
            return Err(VmError::BadAddress);
        }
        let page = fault_addr.page_align_down();

        let entry = match self.lookup(page) {
            Some(entry) => entry,
            None => {
                if self.is_stack_growth(page, user_stack_pointer) {
                    let entry = SptEntry::anonymous(page, SptType::Zero, true, fs.clone());
                    self.insert(entry.clone())?;
                    entry
                } else {
                    return Err(VmError::Unmapped);
                }
            }
        };

        match entry.state() {
            SptState::NotLoaded => entry.load(frame_table, address_space, swap),
            SptState::Swapped => entry.unswap(frame_table, address_space, swap),
            SptState::Loaded => Err(VmError::BadAddress),
        }
    }

    /// `true` if `page` lies within `STACK_GROWTH_SLACK` bytes below the
    /// stack pointer and inside the region the stack may grow into.
    fn is_stack_growth(&self, page: VirtAddr, user_stack_pointer: VirtAddr) -> bool {
        if page < self.stack_bottom {
            return false;
        }
        let sp = user_stack_pointer.as_usize();
        let within_slack = sp.saturating_sub(page.as_usize()) <= STACK_GROWTH_SLACK;
        page.as_usize() <= sp && within_slack
    }

    /// Walks every entry, tearing each down. Called at process exit,
    /// before the address space itself is discarded.
    pub fn destroy_all<A: AddressSpace>(&self, frame_table: &FrameTable, address_space: &A, swap: &SwapArea<D>) {
        let entries: Vec<Arc<SptEntry<D>>> = self.entries.lock().drain().map(|(_, v)| v).collect();
        for entry in entries {
            entry.destroy(frame_table, address_space, swap);
        }
    }
}
