//! The global frame table and eviction.
//!
//! Capacity-gated install/evict over a queue of resident frames, the way
//! a free-list allocator gates allocation; the eviction scan itself
//! reuses the clock-cursor idea the block cache uses for its own
//! replacement policy, applied here to whole pages instead of sectors.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::error::{VmError, VmResult};
use crate::lock::SpinLock;
use crate::param::PGSIZE;
use crate::swap::SwapArea;
use crate::vm::address_space::AddressSpace;
use crate::vm::addr::VirtAddr;
use crate::block_device::BlockDevice;

/// The SPT-side half of eviction: enough for the frame table to ask "is
/// this frame allowed to go" and to hand back control once a victim has
/// been chosen. The `Loaded -> NotLoaded`/`Loaded -> Swapped` transitions
/// themselves are driven from here, in the owning SPT entry's own code.
pub trait FrameOwner: Send + Sync {
    fn is_pinned(&self) -> bool;
    fn is_mmap(&self) -> bool;

    /// The mapping has already been uninstalled; `contents` is what the
    /// frame held. Write back to the backing file here (only ever called
    /// for `Mmap` owners) and transition the owner's state to `NotLoaded`.
    fn on_evicted_to_file(&self, contents: &[u8]);

    /// The mapping has already been uninstalled and `contents` written to
    /// swap slot `slot`. Transition the owner's state to `Swapped`.
    fn on_evicted_to_swap(&self, slot: usize);
}

struct FrameSlot {
    uvaddr: VirtAddr,
    owner: Arc<dyn FrameOwner>,
}

/// A fixed-capacity set of currently-resident frames, shared across every
/// process's address space.
pub struct FrameTable {
    capacity: usize,
    queue: SpinLock<VecDeque<FrameSlot>>,
}

impl FrameTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: SpinLock::new("frame table", VecDeque::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Installs `data` at `uvaddr` in `address_space` and registers the
    /// frame. Fails without side effects if the table is at capacity.
    pub fn install<A: AddressSpace>(
        &self,
        address_space: &A,
        uvaddr: VirtAddr,
        owner: Arc<dyn FrameOwner>,
        data: &[u8],
        writable: bool,
    ) -> VmResult<()> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return Err(VmError::OutOfMemory);
        }
        address_space.install(uvaddr, data, writable);
        queue.push_back(FrameSlot { uvaddr, owner });
        Ok(())
    }

    /// As [`Self::install`], but evicts victims until there is room.
    /// Succeeds unless total committed pages exceed physical capacity.
    pub fn install_with_eviction<A: AddressSpace, D: BlockDevice>(
        &self,
        address_space: &A,
        swap: &SwapArea<D>,
        uvaddr: VirtAddr,
        owner: Arc<dyn FrameOwner>,
        data: &[u8],
        writable: bool,
    ) -> VmResult<()> {
        loop {
            match self.install(address_space, uvaddr, owner.clone(), data, writable) {
                Ok(()) => return Ok(()),
                Err(VmError::OutOfMemory) => {
                    self.evict_one(address_space, swap)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes the bookkeeping entry and the mapping for `uvaddr`, if
    /// present.
    pub fn uninstall<A: AddressSpace>(&self, address_space: &A, uvaddr: VirtAddr) {
        let mut queue = self.queue.lock();
        if let Some(pos) = queue.iter().position(|s| s.uvaddr == uvaddr) {
            queue.remove(pos);
        }
        address_space.uninstall(uvaddr);
    }

    /// The clock/second-chance scan: rotate past pinned and
    /// recently-accessed frames, clearing the accessed bit as we go, and
    /// evict the first frame that is neither.
    pub fn evict_one<A: AddressSpace, D: BlockDevice>(&self, address_space: &A, swap: &SwapArea<D>) -> VmResult<VirtAddr> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return Err(VmError::OutOfMemory);
        }
        let n = queue.len();
        for _ in 0..2 * n {
            let slot = queue.pop_front().expect("checked non-empty above");
            if slot.owner.is_pinned() {
                queue.push_back(slot);
                continue;
            }
            if address_space.is_accessed(slot.uvaddr) {
                address_space.clear_accessed(slot.uvaddr);
                queue.push_back(slot);
                continue;
            }
            let uvaddr = slot.uvaddr;
            drop(queue);
            self.finish_eviction(address_space, swap, slot);
            debug!("frame table: evicted {uvaddr:?}");
            return Ok(uvaddr);
        }
        Err(VmError::OutOfMemory)
    }

    /// A simpler fallback policy for tests: evicts a pseudo-randomly
    /// chosen non-pinned frame instead of scanning for staleness.
    pub fn evict_random<A: AddressSpace, D: BlockDevice>(
        &self,
        address_space: &A,
        swap: &SwapArea<D>,
        seed: u64,
    ) -> VmResult<VirtAddr> {
        let mut queue = self.queue.lock();
        let candidates: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.owner.is_pinned())
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(VmError::OutOfMemory);
        }
        let pick = candidates[(seed as usize) % candidates.len()];
        let slot = queue.remove(pick).expect("pick came from current indices");
        let uvaddr = slot.uvaddr;
        drop(queue);
        self.finish_eviction(address_space, swap, slot);
        Ok(uvaddr)
    }

    fn finish_eviction<A: AddressSpace, D: BlockDevice>(&self, address_space: &A, swap: &SwapArea<D>, slot: FrameSlot) {
        let contents = address_space.read_page(slot.uvaddr);
        address_space.uninstall(slot.uvaddr);
        if slot.owner.is_mmap() {
            slot.owner.on_evicted_to_file(&contents);
        } else {
            let page = if contents.len() == PGSIZE {
                contents
            } else {
                let mut padded = contents;
                padded.resize(PGSIZE, 0);
                padded
            };
            let slot_idx = swap.install(&page);
            slot.owner.on_evicted_to_swap(slot_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use crate::param::PAGE_SECTOR_COUNT;
    use crate::vm::address_space::HashedAddressSpace;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct TestOwner {
        pinned: AtomicBool,
        mmap: bool,
        evicted_to_swap: AtomicUsize,
        evicted_to_file: SpinLock<Vec<u8>>,
    }

    impl TestOwner {
        fn new(mmap: bool) -> Arc<Self> {
            Arc::new(Self {
                pinned: AtomicBool::new(false),
                mmap,
                evicted_to_swap: AtomicUsize::new(usize::MAX),
                evicted_to_file: SpinLock::new("owner", Vec::new()),
            })
        }
    }

    impl FrameOwner for TestOwner {
        fn is_pinned(&self) -> bool {
            self.pinned.load(Ordering::SeqCst)
        }
        fn is_mmap(&self) -> bool {
            self.mmap
        }
        fn on_evicted_to_file(&self, contents: &[u8]) {
            *self.evicted_to_file.lock() = contents.to_vec();
        }
        fn on_evicted_to_swap(&self, slot: usize) {
            self.evicted_to_swap.store(slot, Ordering::SeqCst);
        }
    }

    fn swap_area(pages: usize) -> SwapArea<MemoryBlockDevice> {
        let dev = MemoryBlockDevice::with_reference_geometry(pages * PAGE_SECTOR_COUNT);
        SwapArea::new(dev, PAGE_SECTOR_COUNT)
    }

    #[test]
    fn install_respects_capacity() {
        let table = FrameTable::new(1);
        let a = HashedAddressSpace::new();
        let owner = TestOwner::new(false);
        table.install(&a, VirtAddr::new(PGSIZE), owner.clone(), &vec![1u8; PGSIZE], true).unwrap();
        let err = table
            .install(&a, VirtAddr::new(2 * PGSIZE), owner, &vec![2u8; PGSIZE], true)
            .unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
    }

    #[test]
    fn pinned_frames_are_never_chosen() {
        let table = FrameTable::new(1);
        let a = HashedAddressSpace::new();
        let swap = swap_area(4);
        let owner = TestOwner::new(false);
        owner.pinned.store(true, Ordering::SeqCst);
        table.install(&a, VirtAddr::new(PGSIZE), owner, &vec![1u8; PGSIZE], true).unwrap();
        let err = table.evict_one(&a, &swap).unwrap_err();
        assert_eq!(err, VmError::OutOfMemory);
    }

    #[test]
    fn accessed_frame_is_given_a_second_chance() {
        let table = FrameTable::new(2);
        let a = HashedAddressSpace::new();
        let swap = swap_area(4);
        let stale_owner = TestOwner::new(false);
        let fresh_owner = TestOwner::new(false);
        let stale = VirtAddr::new(PGSIZE);
        let fresh = VirtAddr::new(2 * PGSIZE);
        table.install(&a, stale, stale_owner, &vec![1u8; PGSIZE], true).unwrap();
        table.install(&a, fresh, fresh_owner.clone(), &vec![2u8; PGSIZE], true).unwrap();
        a.touch(fresh);

        let victim = table.evict_one(&a, &swap).unwrap();
        assert_eq!(victim, stale);
        assert_eq!(fresh_owner.evicted_to_swap.load(Ordering::SeqCst), usize::MAX);
    }

    #[test]
    fn mmap_eviction_writes_back_instead_of_swapping() {
        let table = FrameTable::new(1);
        let a = HashedAddressSpace::new();
        let swap = swap_area(4);
        let owner = TestOwner::new(true);
        let uvaddr = VirtAddr::new(PGSIZE);
        table.install(&a, uvaddr, owner.clone(), &vec![0x77u8; PGSIZE], true).unwrap();
        table.evict_one(&a, &swap).unwrap();
        assert_eq!(*owner.evicted_to_file.lock(), vec![0x77u8; PGSIZE]);
        assert_eq!(owner.evicted_to_swap.load(Ordering::SeqCst), usize::MAX);
    }

    #[test]
    fn install_with_eviction_makes_room() {
        let table = FrameTable::new(1);
        let a = HashedAddressSpace::new();
        let swap = swap_area(4);
        let first = TestOwner::new(false);
        let second = TestOwner::new(false);
        table
            .install_with_eviction(&a, &swap, VirtAddr::new(PGSIZE), first, &vec![1u8; PGSIZE], true)
            .unwrap();
        table
            .install_with_eviction(&a, &swap, VirtAddr::new(2 * PGSIZE), second, &vec![2u8; PGSIZE], true)
            .unwrap();
        assert_eq!(table.len(), 1);
    }
}
