//! On-disk inode format and the depth-growing block tree: a uniform N-ary
//! tree of block pointers whose depth grows on demand as a file gets
//! bigger, rather than a fixed direct+indirect+doubly-indirect layout.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::bcache::BlockCache;
use crate::block_device::BlockDevice;
use crate::error::FsError;
use crate::param::{INODE_MAGIC, MAX_DEPTH, NDIRECT, SECTOR_SIZE};

/// The on-disk inode. Exactly one sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct InodeDisk {
    /// File length in bytes, meaningful only at the tree root.
    pub length: i32,
    pub depth: u32,
    pub is_dir: u32,
    pub blocks: [u32; NDIRECT],
    pub magic: u32,
}

const_assert_eq!(std::mem::size_of::<InodeDisk>(), SECTOR_SIZE);

impl InodeDisk {
    pub fn empty(is_dir: bool) -> Self {
        Self {
            length: 0,
            depth: 0,
            is_dir: is_dir as u32,
            blocks: [0; NDIRECT],
            magic: INODE_MAGIC,
        }
    }

    fn empty_at_depth(depth: u32, is_dir: bool) -> Self {
        let mut d = Self::empty(is_dir);
        d.depth = depth;
        d
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }
}

pub(crate) fn read_disk<D: BlockDevice>(cache: &BlockCache<D>, sector: u32) -> InodeDisk {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read_sector(sector, &mut buf);
    InodeDisk::read_from(&buf[..]).expect("sector-sized buffer always parses")
}

pub(crate) fn write_disk<D: BlockDevice>(cache: &BlockCache<D>, sector: u32, disk: &InodeDisk) {
    cache.write_sector(sector, disk.as_bytes());
}

/// A simple bitmap allocator over the sectors reserved for inode and data
/// blocks, one bit per sector. The bitmap lives in memory and is mirrored
/// to disk on `to_bytes`/`from_bytes` so a fresh process can rebuild it
/// after a clean shutdown.
pub struct FreeMap {
    data_start: u32,
    bits: crate::lock::SpinLock<Vec<bool>>,
}

impl FreeMap {
    pub fn new(data_start: u32, sector_count: u32) -> Self {
        Self {
            data_start,
            bits: crate::lock::SpinLock::new("freemap", vec![false; sector_count as usize]),
        }
    }

    pub fn alloc(&self) -> Option<u32> {
        let mut bits = self.bits.lock();
        let idx = bits.iter().position(|&b| !b)?;
        bits[idx] = true;
        Some(self.data_start + idx as u32)
    }

    pub fn free(&self, sector: u32) {
        let mut bits = self.bits.lock();
        let idx = (sector - self.data_start) as usize;
        assert!(bits[idx], "double free of sector {sector}");
        bits[idx] = false;
    }

    /// Serializes the bitmap to raw bytes (one bit per sector) for
    /// persistence at a fixed metadata sector range.
    pub fn to_bytes(&self) -> Vec<u8> {
        let bits = self.bits.lock();
        let mut out = vec![0u8; (bits.len() + 7) / 8];
        for (i, &b) in bits.iter().enumerate() {
            if b {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    pub fn from_bytes(data_start: u32, sector_count: u32, bytes: &[u8]) -> Self {
        let mut bits = vec![false; sector_count as usize];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = bytes.get(i / 8).is_some_and(|byte| byte & (1 << (i % 8)) != 0);
        }
        Self {
            data_start,
            bits: crate::lock::SpinLock::new("freemap", bits),
        }
    }
}

fn required_depth(total_bytes: usize) -> u32 {
    let mut depth = 0u32;
    while NDIRECT.pow(depth + 1) * SECTOR_SIZE < total_bytes {
        depth += 1;
        assert!(depth <= MAX_DEPTH, "inode would need depth > {MAX_DEPTH}");
    }
    depth
}

/// Grows `disk`'s tree so its depth is at least `target_depth`. Preserves
/// all existing pointers by pushing the current root down one level at a
/// time.
pub fn grow_depth<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    target_depth: u32,
) -> Result<(), FsError> {
    while disk.depth < target_depth {
        let sector = freemap.alloc().ok_or(FsError::NoSpace)?;
        write_disk(cache, sector, disk);
        let mut grown = InodeDisk::empty_at_depth(disk.depth + 1, disk.is_dir());
        grown.length = disk.length;
        grown.blocks[0] = sector;
        *disk = grown;
    }
    Ok(())
}

/// Ensures every sector covering the byte range `[from, to)` exists,
/// recursing through indirect levels and creating empty sub-inodes as
/// needed. When `zero_fill`, the touched byte range is explicitly zeroed --
/// including the tail of an already-allocated sector, so that growing past
/// a non-sector-aligned length still produces a clean hole.
fn ensure_range<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    blocks: &mut [u32],
    depth: u32,
    from: usize,
    to: usize,
    zero_fill: bool,
) -> Result<(), FsError> {
    if to <= from {
        return Ok(());
    }
    if depth == 0 {
        let first = from / SECTOR_SIZE;
        let last = (to - 1) / SECTOR_SIZE;
        for idx in first..=last {
            if blocks[idx] == 0 {
                blocks[idx] = freemap.alloc().ok_or(FsError::NoSpace)?;
            }
            if zero_fill {
                let sector_start = idx * SECTOR_SIZE;
                let lo = from.max(sector_start) - sector_start;
                let hi = (to.min(sector_start + SECTOR_SIZE)) - sector_start;
                if hi > lo {
                    cache.write_bytes(blocks[idx], &vec![0u8; hi - lo], lo, hi - lo);
                }
            }
        }
        return Ok(());
    }

    let max_block_size = NDIRECT.pow(depth) * SECTOR_SIZE;
    let first = from / max_block_size;
    let last = (to - 1) / max_block_size;
    for idx in first..=last {
        let child_from = if idx == first { from % max_block_size } else { 0 };
        let child_to = if idx == last {
            let rem = to % max_block_size;
            if rem == 0 {
                max_block_size
            } else {
                rem
            }
        } else {
            max_block_size
        };

        let is_new = blocks[idx] == 0;
        if is_new {
            blocks[idx] = freemap.alloc().ok_or(FsError::NoSpace)?;
        }
        let mut child = if is_new {
            InodeDisk::empty_at_depth(depth - 1, false)
        } else {
            read_disk(cache, blocks[idx])
        };

        match ensure_range(cache, freemap, &mut child.blocks, depth - 1, child_from, child_to, zero_fill) {
            Ok(()) => write_disk(cache, blocks[idx], &child),
            Err(e) => {
                if is_new {
                    freemap.free(blocks[idx]);
                    blocks[idx] = 0;
                } else {
                    write_disk(cache, blocks[idx], &child);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Extends `disk` so `new_len` bytes are addressable. Leaves `disk.length`
/// unchanged on failure, with whatever sectors were allocated before the
/// failure still reachable from the tree.
pub fn grow_length<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    new_len: usize,
    zero: bool,
) -> Result<(), FsError> {
    let cur_len = disk.len();
    if new_len <= cur_len {
        return Ok(());
    }
    ensure_range(cache, freemap, &mut disk.blocks, disk.depth, cur_len, new_len, zero)?;
    disk.length = new_len as i32;
    Ok(())
}

/// Recursive descent shared by `read_at`/`write_at`: transfers at most one
/// leaf sector's worth of bytes and returns the count actually moved.
fn transfer_once<D: BlockDevice>(
    cache: &BlockCache<D>,
    blocks: &[u32],
    depth: u32,
    offset: usize,
    buf: &mut [u8],
    write: bool,
) -> usize {
    if depth == 0 {
        let idx = offset / SECTOR_SIZE;
        if idx >= blocks.len() || blocks[idx] == 0 {
            return 0;
        }
        let sector = blocks[idx];
        let ofs_in_sector = offset % SECTOR_SIZE;
        let n = buf.len().min(SECTOR_SIZE - ofs_in_sector);
        if write {
            cache.write_bytes(sector, &buf[..n], ofs_in_sector, n);
        } else {
            cache.read_bytes(sector, &mut buf[..n], ofs_in_sector, n);
        }
        n
    } else {
        let max_block_size = NDIRECT.pow(depth) * SECTOR_SIZE;
        let idx = offset / max_block_size;
        if idx >= blocks.len() || blocks[idx] == 0 {
            return 0;
        }
        let child = read_disk(cache, blocks[idx]);
        let child_offset = offset % max_block_size;
        let n = buf.len().min(max_block_size - child_offset);
        transfer_once(cache, &child.blocks, depth - 1, child_offset, &mut buf[..n], write)
    }
}

/// Reads up to `size` bytes starting at `offset`. Returns the number of
/// bytes actually copied; a short read signals end-of-file.
pub fn read_at<D: BlockDevice>(cache: &BlockCache<D>, disk: &InodeDisk, buf: &mut [u8], size: usize, offset: usize) -> usize {
    let avail = disk.len().saturating_sub(offset);
    let to_read = size.min(avail).min(buf.len());
    let mut done = 0;
    while done < to_read {
        let n = transfer_once(cache, &disk.blocks, disk.depth, offset + done, &mut buf[done..to_read], false);
        if n == 0 {
            break;
        }
        done += n;
    }
    done
}

/// Writes `size` bytes at `offset`, growing depth and length as needed.
/// Returns the number of bytes written, which is `size` unless the disk is
/// out of space.
pub fn write_at<D: BlockDevice>(
    cache: &BlockCache<D>,
    freemap: &FreeMap,
    disk: &mut InodeDisk,
    buf: &[u8],
    size: usize,
    offset: usize,
) -> Result<usize, FsError> {
    let needed_depth = required_depth(offset + size);
    if needed_depth > disk.depth {
        grow_depth(cache, freemap, disk, needed_depth)?;
    }
    if offset > disk.len() {
        grow_length(cache, freemap, disk, offset, true)?;
    }
    grow_length(cache, freemap, disk, offset + size, false)?;

    let mut done = 0;
    while done < size {
        let mut chunk = buf[done..size].to_vec();
        let n = transfer_once(cache, &disk.blocks, disk.depth, offset + done, &mut chunk, true);
        assert!(n > 0, "write_at made no progress after growth succeeded");
        done += n;
    }
    Ok(done)
}

/// Releases every allocated data/indirect sector, innermost first.
/// The inode's own sector is not released here -- the caller
/// (the in-memory handle's close path) frees it once this returns.
pub fn free_tree<D: BlockDevice>(cache: &BlockCache<D>, freemap: &FreeMap, blocks: &[u32], depth: u32) {
    for &sector in blocks {
        if sector == 0 {
            continue;
        }
        if depth > 0 {
            let child = read_disk(cache, sector);
            free_tree(cache, freemap, &child.blocks, depth - 1);
        }
        freemap.free(sector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemoryBlockDevice;
    use std::sync::Arc;

    fn setup(sectors: usize) -> (BlockCache<MemoryBlockDevice>, FreeMap) {
        let dev = Arc::new(MemoryBlockDevice::with_reference_geometry(sectors));
        let cache = BlockCache::new(dev, 32);
        let freemap = FreeMap::new(1, (sectors - 1) as u32);
        (cache, freemap)
    }

    #[test]
    fn inode_disk_is_one_sector() {
        assert_eq!(std::mem::size_of::<InodeDisk>(), SECTOR_SIZE);
    }

    #[test]
    fn write_then_read_roundtrip_direct() {
        let (cache, freemap) = setup(2000);
        let mut disk = InodeDisk::empty(false);
        let data = b"hello inode tree";
        write_at(&cache, &freemap, &mut disk, data, data.len(), 10).unwrap();
        let mut out = vec![0u8; data.len()];
        let n = read_at(&cache, &disk, &mut out, data.len(), 10);
        assert_eq!(n, data.len());
        assert_eq!(&out, data);
    }

    /// Writing one byte past direct-block capacity
    /// grows the tree to depth 1 with a correctly zero-filled hole.
    #[test]
    fn depth_grows_past_direct_capacity() {
        let sectors = NDIRECT * 2 + 16;
        let (cache, freemap) = setup(sectors);
        let mut disk = InodeDisk::empty(false);
        let direct_capacity = NDIRECT * SECTOR_SIZE;
        write_at(&cache, &freemap, &mut disk, &[0x42], 1, direct_capacity).unwrap();
        assert_eq!(disk.depth, 1);
        assert_eq!(disk.len(), direct_capacity + 1);

        let mut out = vec![0u8; direct_capacity + 1];
        let n = read_at(&cache, &disk, &mut out, direct_capacity + 1, 0);
        assert_eq!(n, direct_capacity + 1);
        assert!(out[..direct_capacity].iter().all(|&b| b == 0));
        assert_eq!(out[direct_capacity], 0x42);
    }

    #[test]
    fn hole_reads_as_zero() {
        let (cache, freemap) = setup(64);
        let mut disk = InodeDisk::empty(false);
        write_at(&cache, &freemap, &mut disk, b"end", 3, 2000).unwrap();
        let mut out = vec![0xFFu8; 2000];
        let n = read_at(&cache, &disk, &mut out, 2000, 0);
        assert_eq!(n, 2000);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn short_read_past_eof() {
        let (cache, freemap) = setup(64);
        let mut disk = InodeDisk::empty(false);
        write_at(&cache, &freemap, &mut disk, b"abc", 3, 0).unwrap();
        let mut out = [0u8; 10];
        let n = read_at(&cache, &disk, &mut out, 10, 0);
        assert_eq!(n, 3);
    }

    #[test]
    fn removal_frees_every_sector() {
        let sectors = NDIRECT * 2 + 16;
        let (cache, freemap) = setup(sectors);
        let mut disk = InodeDisk::empty(false);
        let direct_capacity = NDIRECT * SECTOR_SIZE;
        write_at(&cache, &freemap, &mut disk, &[1], 1, direct_capacity).unwrap();
        free_tree(&cache, &freemap, &disk.blocks, disk.depth);
        // Every sector should now be allocatable again, i.e. exactly the
        // same count as a pristine free map.
        let mut reclaimed = 0;
        while freemap.alloc().is_some() {
            reclaimed += 1;
        }
        assert_eq!(reclaimed, sectors - 1);
    }
}
