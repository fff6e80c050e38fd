//! Directory contents and name resolution: a directory is a file whose
//! data is a sequence of fixed-size `Dirent` records, walked linearly and
//! addressed through `fs::inode`'s depth-tree, with `.` and `..` as
//! ordinary entries pointing back at the directory itself and its parent.

use zerocopy::{AsBytes, FromBytes};

use crate::bcache::BlockCache;
use crate::block_device::BlockDevice;
use crate::error::FsError;
use crate::fs::inode::{self, FreeMap, InodeDisk};
use crate::param::NAME_MAX;

/// One fixed-size directory entry: a sector number and a name.
/// `inode_sector == 0` marks an unused slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Dirent {
    pub inode_sector: u32,
    pub name: [u8; NAME_MAX],
}

pub const DIRENT_SIZE: usize = std::mem::size_of::<Dirent>();

impl Dirent {
    fn free() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX],
        }
    }

    fn in_use(&self) -> bool {
        self.inode_sector != 0
    }

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) -> Result<(), FsError> {
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        self.name = [0; NAME_MAX];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }
}

/// Reads the `idx`-th dirent slot out of a directory inode's data, or
/// `None` past the end of the directory's current length.
fn read_entry<D: BlockDevice>(cache: &BlockCache<D>, disk: &InodeDisk, idx: usize) -> Option<Dirent> {
    let offset = idx * DIRENT_SIZE;
    if offset >= disk.len() {
        return None;
    }
    let mut buf = [0u8; DIRENT_SIZE];
    let n = inode::read_at(cache, disk, &mut buf, DIRENT_SIZE, offset);
    assert_eq!(n, DIRENT_SIZE, "directory length not a multiple of DIRENT_SIZE");
    Some(Dirent::read_from(&buf[..]).expect("sector-sized buffer always parses"))
}

fn write_entry<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    idx: usize,
    entry: &Dirent,
) -> Result<(), FsError> {
    let offset = idx * DIRENT_SIZE;
    inode::write_at(cache, freemap, disk, entry.as_bytes(), DIRENT_SIZE, offset)?;
    Ok(())
}

fn entry_count(disk: &InodeDisk) -> usize {
    disk.len() / DIRENT_SIZE
}

/// Looks up `name` in the directory `disk`. Returns the inode sector
/// holding the found entry.
pub fn lookup<D: BlockDevice>(cache: &BlockCache<D>, disk: &InodeDisk, name: &str) -> Option<u32> {
    for idx in 0..entry_count(disk) {
        let entry = read_entry(cache, disk, idx)?;
        if entry.in_use() && entry.name_str() == name {
            return Some(entry.inode_sector);
        }
    }
    None
}

/// Adds `(name, inode_sector)` to the directory, reusing a free slot if one
/// exists or appending a new one otherwise. Fails with
/// [`FsError::NameCollision`] if the name is already present.
pub fn add_entry<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    name: &str,
    inode_sector: u32,
) -> Result<(), FsError> {
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    let count = entry_count(disk);
    let mut free_slot = None;
    for idx in 0..count {
        let entry = read_entry(cache, disk, idx).expect("idx < entry_count always has an entry");
        if entry.in_use() {
            if entry.name_str() == name {
                return Err(FsError::NameCollision);
            }
        } else if free_slot.is_none() {
            free_slot = Some(idx);
        }
    }

    let mut new_entry = Dirent::free();
    new_entry.inode_sector = inode_sector;
    new_entry.set_name(name)?;
    let idx = free_slot.unwrap_or(count);
    write_entry(cache, freemap, disk, idx, &new_entry)
}

/// Removes the entry named `name`, by clearing its slot in place.
/// Removal never shrinks the directory's tree, it only frees the slot
/// for reuse.
pub fn remove_entry<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    name: &str,
) -> Result<u32, FsError> {
    for idx in 0..entry_count(disk) {
        let entry = read_entry(cache, disk, idx).expect("idx < entry_count always has an entry");
        if entry.in_use() && entry.name_str() == name {
            write_entry(cache, freemap, disk, idx, &Dirent::free())?;
            return Ok(entry.inode_sector);
        }
    }
    Err(FsError::NotFound)
}

/// `true` if the directory holds no entries besides `.` and `..`. A
/// directory must satisfy this before it can be removed.
pub fn is_empty<D: BlockDevice>(cache: &BlockCache<D>, disk: &InodeDisk) -> bool {
    for idx in 0..entry_count(disk) {
        let Some(entry) = read_entry(cache, disk, idx) else {
            continue;
        };
        if entry.in_use() && entry.name_str() != "." && entry.name_str() != ".." {
            return false;
        }
    }
    true
}

/// Lists every in-use entry as `(name, inode_sector)` pairs, in slot order,
/// skipping `.` and `..`.
pub fn list<D: BlockDevice>(cache: &BlockCache<D>, disk: &InodeDisk) -> Vec<(String, u32)> {
    let mut out = Vec::new();
    for idx in 0..entry_count(disk) {
        if let Some(entry) = read_entry(cache, disk, idx) {
            if entry.in_use() && entry.name_str() != "." && entry.name_str() != ".." {
                out.push((entry.name_str().to_string(), entry.inode_sector));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use std::sync::Arc;

    fn setup() -> (BlockCache<MemoryBlockDevice>, FreeMap) {
        let dev = Arc::new(MemoryBlockDevice::with_reference_geometry(256));
        let cache = BlockCache::new(dev, 32);
        let freemap = FreeMap::new(1, 255);
        (cache, freemap)
    }

    #[test]
    fn add_then_lookup() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, "a.txt", 10).unwrap();
        add_entry(&cache, &freemap, &mut dir, "b.txt", 11).unwrap();
        assert_eq!(lookup(&cache, &dir, "a.txt"), Some(10));
        assert_eq!(lookup(&cache, &dir, "b.txt"), Some(11));
        assert_eq!(lookup(&cache, &dir, "missing"), None);
    }

    #[test]
    fn duplicate_name_rejected() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, "x", 5).unwrap();
        let err = add_entry(&cache, &freemap, &mut dir, "x", 6).unwrap_err();
        assert_eq!(err, FsError::NameCollision);
    }

    #[test]
    fn remove_then_reuse_slot() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, "x", 5).unwrap();
        add_entry(&cache, &freemap, &mut dir, "y", 6).unwrap();
        let len_before = dir.len();
        remove_entry(&cache, &freemap, &mut dir, "x").unwrap();
        assert_eq!(lookup(&cache, &dir, "x"), None);
        add_entry(&cache, &freemap, &mut dir, "z", 7).unwrap();
        // Reused the freed slot instead of growing the directory.
        assert_eq!(dir.len(), len_before);
        assert_eq!(lookup(&cache, &dir, "z"), Some(7));
    }

    #[test]
    fn name_too_long_rejected() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        let long_name = "a".repeat(NAME_MAX + 1);
        let err = add_entry(&cache, &freemap, &mut dir, &long_name, 1).unwrap_err();
        assert_eq!(err, FsError::NameTooLong);
    }

    #[test]
    fn empty_ignores_dot_and_dotdot() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, ".", 2).unwrap();
        add_entry(&cache, &freemap, &mut dir, "..", 1).unwrap();
        assert!(is_empty(&cache, &dir));
        add_entry(&cache, &freemap, &mut dir, "child", 3).unwrap();
        assert!(!is_empty(&cache, &dir));
    }

    #[test]
    fn list_returns_in_use_entries() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, "a", 2).unwrap();
        add_entry(&cache, &freemap, &mut dir, "b", 3).unwrap();
        remove_entry(&cache, &freemap, &mut dir, "a").unwrap();
        let entries = list(&cache, &dir);
        assert_eq!(entries, vec![("b".to_string(), 3)]);
    }

    #[test]
    fn list_skips_dot_and_dotdot() {
        let (cache, freemap) = setup();
        let mut dir = InodeDisk::empty(true);
        add_entry(&cache, &freemap, &mut dir, ".", 2).unwrap();
        add_entry(&cache, &freemap, &mut dir, "..", 1).unwrap();
        add_entry(&cache, &freemap, &mut dir, "b", 3).unwrap();
        let entries = list(&cache, &dir);
        assert_eq!(entries, vec![("b".to_string(), 3)]);
    }
}
