//! The per-process page-mapping boundary the frame table and SPT drive.
//!
//! A real page table walks an Sv39-style tree bit by bit. Hosted on
//! `std`, there is no MMU to program, so this crate narrows the same
//! contract to a trait: install a page's bytes at a user virtual address
//! with a writable bit, uninstall it, and query/clear the accessed and
//! dirty bits a real page-table entry would carry. [`HashedAddressSpace`]
//! is the one implementation, a process's private table of resident
//! pages backed by a `HashMap`.

use std::collections::HashMap;

use crate::lock::SpinLock;
use crate::param::PGSIZE;
use crate::vm::addr::VirtAddr;

/// The page-mapping operations the frame table and SPT need from a
/// process's address space.
pub trait AddressSpace: Send + Sync {
    /// Maps `uvaddr` to `data` (exactly one page). Clears accessed/dirty.
    fn install(&self, uvaddr: VirtAddr, data: &[u8], writable: bool);

    /// Removes the mapping at `uvaddr`. No-op if absent.
    fn uninstall(&self, uvaddr: VirtAddr);

    /// Copies out the current contents of the mapped page.
    fn read_page(&self, uvaddr: VirtAddr) -> Vec<u8>;

    fn is_accessed(&self, uvaddr: VirtAddr) -> bool;
    fn clear_accessed(&self, uvaddr: VirtAddr);

    fn is_dirty(&self, uvaddr: VirtAddr) -> bool;
    fn clear_dirty(&self, uvaddr: VirtAddr);

    /// Test/debug hook: simulates the hardware setting the accessed bit on
    /// a load or store through the mapping.
    fn touch(&self, uvaddr: VirtAddr);

    /// Test/debug hook: simulates a store through a writable mapping.
    fn touch_write(&self, uvaddr: VirtAddr, at: usize, byte: u8);
}

struct Mapping {
    data: Vec<u8>,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A process's resident-page table, keyed by page-aligned user virtual
/// address.
#[derive(Default)]
pub struct HashedAddressSpace {
    pages: SpinLock<HashMap<VirtAddr, Mapping>>,
}

impl HashedAddressSpace {
    pub fn new() -> Self {
        Self {
            pages: SpinLock::new("address space", HashMap::new()),
        }
    }
}

impl AddressSpace for HashedAddressSpace {
    fn install(&self, uvaddr: VirtAddr, data: &[u8], writable: bool) {
        assert_eq!(data.len(), PGSIZE, "install requires exactly one page");
        let mapping = Mapping {
            data: data.to_vec(),
            writable,
            accessed: false,
            dirty: false,
        };
        let prior = self.pages.lock().insert(uvaddr, mapping);
        assert!(prior.is_none(), "install over an already-mapped address {uvaddr:?}");
    }

    fn uninstall(&self, uvaddr: VirtAddr) {
        self.pages.lock().remove(&uvaddr);
    }

    fn read_page(&self, uvaddr: VirtAddr) -> Vec<u8> {
        self.pages
            .lock()
            .get(&uvaddr)
            .map(|m| m.data.clone())
            .unwrap_or_else(|| panic!("read_page of unmapped address {uvaddr:?}"))
    }

    fn is_accessed(&self, uvaddr: VirtAddr) -> bool {
        self.pages.lock().get(&uvaddr).map(|m| m.accessed).unwrap_or(false)
    }

    fn clear_accessed(&self, uvaddr: VirtAddr) {
        if let Some(m) = self.pages.lock().get_mut(&uvaddr) {
            m.accessed = false;
        }
    }

    fn is_dirty(&self, uvaddr: VirtAddr) -> bool {
        self.pages.lock().get(&uvaddr).map(|m| m.dirty).unwrap_or(false)
    }

    fn clear_dirty(&self, uvaddr: VirtAddr) {
        if let Some(m) = self.pages.lock().get_mut(&uvaddr) {
            m.dirty = false;
        }
    }

    fn touch(&self, uvaddr: VirtAddr) {
        if let Some(m) = self.pages.lock().get_mut(&uvaddr) {
            m.accessed = true;
        }
    }

    fn touch_write(&self, uvaddr: VirtAddr, at: usize, byte: u8) {
        let mut pages = self.pages.lock();
        let m = pages.get_mut(&uvaddr).unwrap_or_else(|| panic!("write to unmapped address {uvaddr:?}"));
        assert!(m.writable, "write through a read-only mapping at {uvaddr:?}");
        m.data[at] = byte;
        m.accessed = true;
        m.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_uninstall_roundtrip() {
        let a = HashedAddressSpace::new();
        let uvaddr = VirtAddr::new(PGSIZE);
        let page = vec![7u8; PGSIZE];
        a.install(uvaddr, &page, true);
        assert_eq!(a.read_page(uvaddr), page);
        a.uninstall(uvaddr);
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let a = HashedAddressSpace::new();
        let uvaddr = VirtAddr::new(PGSIZE);
        a.install(uvaddr, &vec![0u8; PGSIZE], true);
        assert!(!a.is_accessed(uvaddr));
        assert!(!a.is_dirty(uvaddr));
        a.touch_write(uvaddr, 0, 9);
        assert!(a.is_accessed(uvaddr));
        assert!(a.is_dirty(uvaddr));
        a.clear_accessed(uvaddr);
        a.clear_dirty(uvaddr);
        assert!(!a.is_accessed(uvaddr));
        assert!(!a.is_dirty(uvaddr));
    }

    #[test]
    #[should_panic(expected = "read-only mapping")]
    fn write_through_readonly_mapping_panics() {
        let a = HashedAddressSpace::new();
        let uvaddr = VirtAddr::new(PGSIZE);
        a.install(uvaddr, &vec![0u8; PGSIZE], false);
        a.touch_write(uvaddr, 0, 1);
    }
}
