//! Swap area.
//!
//! A flat array of page-sized slots on a raw block device, tracked by a
//! bitmap held only in memory -- no metadata lives on disk. There is no
//! LRU or swap_map here: the caller (the SPT entry) owns the
//! slot-to-page association and simply hands back the slot index it was
//! given at install time.

use log::trace;

use crate::block_device::BlockDevice;
use crate::lock::SpinLock;
use crate::param::SECTOR_SIZE;

/// One page-sized slot's worth of sectors.
pub struct SwapArea<D: BlockDevice> {
    device: D,
    sectors_per_page: usize,
    bitmap: SpinLock<Vec<bool>>,
}

impl<D: BlockDevice> SwapArea<D> {
    /// `sectors_per_page` is the page-to-sector ratio, `PAGE_SECTOR_COUNT`.
    pub fn new(device: D, sectors_per_page: usize) -> Self {
        let slot_count = device.sector_count() / sectors_per_page;
        Self {
            device,
            sectors_per_page,
            bitmap: SpinLock::new("swap bitmap", vec![false; slot_count]),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.bitmap.lock().len()
    }

    /// Writes `page` to a newly claimed slot. Fatal if the swap area is
    /// full.
    pub fn install(&self, page: &[u8]) -> usize {
        assert_eq!(page.len(), self.sectors_per_page * SECTOR_SIZE);
        let slot = {
            let mut bitmap = self.bitmap.lock();
            let slot = bitmap
                .iter()
                .position(|&used| !used)
                .unwrap_or_else(|| panic!("swap area exhausted: {} slots all in use", bitmap.len()));
            bitmap[slot] = true;
            slot
        };
        for (i, chunk) in page.chunks(SECTOR_SIZE).enumerate() {
            self.device
                .write((slot * self.sectors_per_page + i) as u32, chunk);
        }
        trace!("swap: installed slot {slot}");
        slot
    }

    /// Reads back `slot`'s contents into `page` and frees the slot.
    pub fn uninstall(&self, slot: usize, page: &mut [u8]) {
        assert_eq!(page.len(), self.sectors_per_page * SECTOR_SIZE);
        {
            let mut bitmap = self.bitmap.lock();
            assert!(bitmap[slot], "uninstall of free swap slot {slot}");
            bitmap[slot] = false;
        }
        for (i, chunk) in page.chunks_mut(SECTOR_SIZE).enumerate() {
            self.device
                .read((slot * self.sectors_per_page + i) as u32, chunk);
        }
        trace!("swap: uninstalled slot {slot}");
    }

    /// Frees `slot` without touching the device: used during process
    /// teardown, when the page's contents are no longer wanted.
    pub fn remove(&self, slot: usize) {
        let mut bitmap = self.bitmap.lock();
        assert!(bitmap[slot], "remove of free swap slot {slot}");
        bitmap[slot] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use crate::param::PAGE_SECTOR_COUNT;

    fn area(pages: usize) -> SwapArea<MemoryBlockDevice> {
        let dev = MemoryBlockDevice::with_reference_geometry(pages * PAGE_SECTOR_COUNT);
        SwapArea::new(dev, PAGE_SECTOR_COUNT)
    }

    /// The round trip is byte-identical and the bitmap returns to its
    /// prior state.
    #[test]
    fn install_uninstall_roundtrip() {
        let sw = area(4);
        let page = vec![0x5Au8; PAGE_SECTOR_COUNT * SECTOR_SIZE];
        let slot = sw.install(&page);
        let mut out = vec![0u8; page.len()];
        sw.uninstall(slot, &mut out);
        assert_eq!(out, page);
        // slot is free again and can be reused.
        let slot2 = sw.install(&page);
        assert_eq!(slot, slot2);
    }

    #[test]
    fn remove_frees_without_io() {
        let sw = area(2);
        let page = vec![1u8; PAGE_SECTOR_COUNT * SECTOR_SIZE];
        let slot = sw.install(&page);
        sw.remove(slot);
        let slot2 = sw.install(&vec![2u8; page.len()]);
        assert_eq!(slot, slot2);
    }

    #[test]
    #[should_panic(expected = "swap area exhausted")]
    fn full_swap_panics() {
        let sw = area(1);
        let page = vec![0u8; PAGE_SECTOR_COUNT * SECTOR_SIZE];
        let _ = sw.install(&page);
        let _ = sw.install(&page);
    }
}
