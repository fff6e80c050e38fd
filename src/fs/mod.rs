//! The file system: superblock, free-space bookkeeping, and the directory
//! tree tied together over a [`BlockCache`].
//!
//! A [`Superblock`] lives at a fixed sector, and a single struct owns all
//! device-backed state. There is no write-ahead log: every mutating call
//! persists the free bitmap and flushes the cache before returning
//! ([`FileSystem::sync`]), which gives the same "durable before the call
//! returns" contract without redo-log machinery. Concurrent mutations are
//! serialized through a single [`SleepLock`], since they may block on
//! device I/O partway through.
//!
//! In-memory inodes follow an explicit `iget`/`close` discipline -- an
//! `Inode` handle is a bare sector number, with no `Drop` impl -- because
//! releasing a removed inode's blocks needs the file system's free map,
//! which a destructor has no way to reach.

use std::collections::HashMap;
use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::bcache::BlockCache;
use crate::block_device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::lock::{SleepLock, SpinLock};
use crate::param::SECTOR_SIZE;

pub mod dir;
pub mod inode;
pub mod path;

use path::is_absolute;

use inode::{FreeMap, InodeDisk};

const SB_MAGIC: u32 = 0x5653_4653; // "VSFS"

/// Sector 0's contents: enough to rebuild the free map and find the root
/// directory after remounting.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct Superblock {
    magic: u32,
    sector_count: u32,
    bitmap_start: u32,
    bitmap_sectors: u32,
    data_start: u32,
    root_sector: u32,
}

/// A handle to an open inode. Carries no data of its own -- every
/// operation re-reads the on-disk inode through the block cache, which
/// already caches hot sectors, so a second-level cache here would just be
/// a second source of truth to keep synchronized.
#[derive(Debug)]
pub struct Inode {
    sector: u32,
}

impl Inode {
    pub fn sector(&self) -> u32 {
        self.sector
    }
}

struct TableEntry {
    refcount: usize,
    removed: bool,
}

/// A mounted file system over a block device.
pub struct FileSystem<D: BlockDevice> {
    cache: BlockCache<D>,
    freemap: FreeMap,
    bitmap_start: u32,
    bitmap_sectors: u32,
    root_sector: u32,
    table: SpinLock<HashMap<u32, TableEntry>>,
    deny_write: SpinLock<HashMap<u32, usize>>,
    /// Serializes directory-tree mutations (`create`, `remove`, `write`,
    /// and the free-on-last-close path); may be held across block I/O.
    mutation_lock: SleepLock<()>,
}

impl<D: BlockDevice> FileSystem<D> {
    /// Computes how many sectors a bitmap covering every sector past the
    /// reserved prefix needs, without the chicken-and-egg of the bitmap's
    /// own size changing how many sectors are left to cover. One bit per
    /// `8 * SECTOR_SIZE + 1` total sectors is always enough headroom; see
    /// the derivation in the module's tests.
    fn bitmap_sectors_for(total_sectors: usize) -> u32 {
        let bits_per_sector_plus_one = 8 * SECTOR_SIZE + 1;
        (((total_sectors.saturating_sub(1)) + bits_per_sector_plus_one - 1) / bits_per_sector_plus_one).max(1) as u32
    }

    /// Initializes a fresh file system on `device`: writes a superblock,
    /// an empty free map, and a root directory containing only `.` and
    /// `..`.
    pub fn format(device: Arc<D>, cache_entries: usize) -> Self {
        let total_sectors = device.sector_count();
        let bitmap_sectors = Self::bitmap_sectors_for(total_sectors);
        let bitmap_start = 1u32;
        let data_start = bitmap_start + bitmap_sectors;
        let data_count = total_sectors as u32 - data_start;

        let cache = BlockCache::new(device, cache_entries);
        let freemap = FreeMap::new(data_start, data_count);
        let root_sector = freemap.alloc().expect("fresh file system always has room for the root");

        let mut root_disk = InodeDisk::empty(true);
        dir::add_entry(&cache, &freemap, &mut root_disk, ".", root_sector).expect("empty root always accepts .");
        dir::add_entry(&cache, &freemap, &mut root_disk, "..", root_sector).expect("empty root always accepts ..");
        inode::write_disk(&cache, root_sector, &root_disk);

        let fs = Self {
            cache,
            freemap,
            bitmap_start,
            bitmap_sectors,
            root_sector,
            table: SpinLock::new("inode table", HashMap::new()),
            deny_write: SpinLock::new("deny-write table", HashMap::new()),
            mutation_lock: SleepLock::new("fs mutation lock", ()),
        };

        let sb = Superblock {
            magic: SB_MAGIC,
            sector_count: total_sectors as u32,
            bitmap_start,
            bitmap_sectors,
            data_start,
            root_sector,
        };
        fs.cache.write_sector(0, sb.as_bytes());
        fs.sync();
        fs
    }

    /// Reopens a file system previously written by [`Self::format`],
    /// reconstructing the free map from its persisted bitmap.
    pub fn open(device: Arc<D>, cache_entries: usize) -> Self {
        let cache = BlockCache::new(device, cache_entries);
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read_sector(0, &mut buf);
        let sb = Superblock::read_from(&buf[..]).expect("sector-sized buffer always parses");
        assert_eq!(sb.magic, SB_MAGIC, "not a formatted file system");

        let data_count = sb.sector_count - sb.data_start;
        let bitmap_bytes_len = sb.bitmap_sectors as usize * SECTOR_SIZE;
        let mut bitmap_bytes = vec![0u8; bitmap_bytes_len];
        for i in 0..sb.bitmap_sectors {
            let start = i as usize * SECTOR_SIZE;
            cache.read_sector(sb.bitmap_start + i, &mut bitmap_bytes[start..start + SECTOR_SIZE]);
        }
        let freemap = FreeMap::from_bytes(sb.data_start, data_count, &bitmap_bytes);

        Self {
            cache,
            freemap,
            bitmap_start: sb.bitmap_start,
            bitmap_sectors: sb.bitmap_sectors,
            root_sector: sb.root_sector,
            table: SpinLock::new("inode table", HashMap::new()),
            deny_write: SpinLock::new("deny-write table", HashMap::new()),
            mutation_lock: SleepLock::new("fs mutation lock", ()),
        }
    }

    /// The sector holding the root directory's inode, usable as a `cwd`
    /// argument whenever a path is known to be absolute.
    pub fn root_sector(&self) -> u32 {
        self.root_sector
    }

    /// Marks `inode` as not to be written while held, used while an
    /// executable image is mapped. Nests: `deny_write_cnt` never exceeds
    /// the inode's open count, and writes stay blocked until every
    /// matching [`Self::allow_write`] has run.
    pub fn deny_write(&self, inode: &Inode) {
        *self.deny_write.lock().entry(inode.sector).or_insert(0) += 1;
    }

    pub fn allow_write(&self, inode: &Inode) {
        let mut table = self.deny_write.lock();
        let count = table.get_mut(&inode.sector).expect("allow_write without a matching deny_write");
        *count -= 1;
        if *count == 0 {
            table.remove(&inode.sector);
        }
    }

    fn write_denied(&self, sector: u32) -> bool {
        self.deny_write.lock().contains_key(&sector)
    }

    /// Persists the free bitmap and flushes every dirty cache entry.
    /// Called at the end of every operation that allocates, frees, or
    /// writes.
    fn sync(&self) {
        let bytes = self.freemap.to_bytes();
        let mut padded = vec![0u8; self.bitmap_sectors as usize * SECTOR_SIZE];
        padded[..bytes.len()].copy_from_slice(&bytes);
        for i in 0..self.bitmap_sectors {
            let start = i as usize * SECTOR_SIZE;
            self.cache.write_sector(self.bitmap_start + i, &padded[start..start + SECTOR_SIZE]);
        }
        self.cache.flush();
    }

    fn load_inode(&self, sector: u32) -> InodeDisk {
        inode::read_disk(&self.cache, sector)
    }

    fn store_inode(&self, sector: u32, disk: &InodeDisk) {
        inode::write_disk(&self.cache, sector, disk);
    }

    fn iget(&self, sector: u32) -> Inode {
        let mut table = self.table.lock();
        table
            .entry(sector)
            .and_modify(|e| e.refcount += 1)
            .or_insert(TableEntry { refcount: 1, removed: false });
        Inode { sector }
    }

    /// Releases a handle. If this was the last reference to an inode
    /// already unlinked from every directory, its blocks are freed here.
    pub fn close(&self, inode: Inode) {
        let should_free = {
            let mut table = self.table.lock();
            let entry = table.get_mut(&inode.sector).expect("close of an inode not in the table");
            entry.refcount -= 1;
            let free = entry.refcount == 0 && entry.removed;
            if entry.refcount == 0 {
                table.remove(&inode.sector);
            }
            free
        };
        if should_free {
            let _guard = self.mutation_lock.lock();
            let disk = self.load_inode(inode.sector);
            inode::free_tree(&self.cache, &self.freemap, &disk.blocks, disk.depth);
            self.freemap.free(inode.sector);
            self.sync();
        }
    }

    /// Resolves `path` to the sector of the inode it names, starting from
    /// `cwd` if `path` is relative and from the root if it is absolute.
    fn resolve(&self, cwd: u32, path: &str) -> FsResult<u32> {
        let mut cur = if is_absolute(path) { self.root_sector } else { cwd };
        for comp in path::components(path) {
            let disk = self.load_inode(cur);
            if !disk.is_dir() {
                return Err(FsError::NotADirectory);
            }
            cur = dir::lookup(&self.cache, &disk, comp).ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    /// As [`Self::resolve`], but for a path's directory component: an
    /// empty parent (a bare name with no `/`) means "this directory",
    /// i.e. `cwd` itself, without a lookup.
    fn resolve_dir(&self, cwd: u32, parent: &str) -> FsResult<u32> {
        if parent.is_empty() {
            Ok(cwd)
        } else {
            self.resolve(cwd, parent)
        }
    }

    /// Opens an existing path and returns a handle. `cwd` is the sector
    /// relative paths resolve against; absolute paths ignore it.
    pub fn open_path(&self, cwd: u32, path: &str) -> FsResult<Inode> {
        let sector = self.resolve(cwd, path)?;
        Ok(self.iget(sector))
    }

    fn create_impl(&self, cwd: u32, path: &str, is_dir: bool) -> FsResult<Inode> {
        let _guard = self.mutation_lock.lock();
        let (parent_str, name) = path::split(path);
        if name.is_empty() {
            return Err(FsError::NameCollision);
        }
        let parent_sector = self.resolve_dir(cwd, parent_str)?;
        let mut parent_disk = self.load_inode(parent_sector);
        if !parent_disk.is_dir() {
            return Err(FsError::NotADirectory);
        }
        if dir::lookup(&self.cache, &parent_disk, name).is_some() {
            return Err(FsError::NameCollision);
        }

        let child_sector = self.freemap.alloc().ok_or(FsError::NoSpace)?;
        let mut child_disk = InodeDisk::empty(is_dir);
        if is_dir {
            dir::add_entry(&self.cache, &self.freemap, &mut child_disk, ".", child_sector)?;
            dir::add_entry(&self.cache, &self.freemap, &mut child_disk, "..", parent_sector)?;
        }
        self.store_inode(child_sector, &child_disk);

        if let Err(e) = dir::add_entry(&self.cache, &self.freemap, &mut parent_disk, name, child_sector) {
            inode::free_tree(&self.cache, &self.freemap, &child_disk.blocks, child_disk.depth);
            self.freemap.free(child_sector);
            return Err(e);
        }
        self.store_inode(parent_sector, &parent_disk);
        self.sync();
        Ok(self.iget(child_sector))
    }

    /// Creates a regular file at `path`, relative to `cwd` if not absolute.
    pub fn create(&self, cwd: u32, path: &str) -> FsResult<Inode> {
        self.create_impl(cwd, path, false)
    }

    /// Creates a directory at `path`, pre-populated with `.` and `..`.
    pub fn create_dir(&self, cwd: u32, path: &str) -> FsResult<Inode> {
        self.create_impl(cwd, path, true)
    }

    /// Unlinks `path` from its parent directory. A directory must be
    /// empty (besides `.`/`..`) to be removed. Blocks are released
    /// immediately if nothing has the inode open, or deferred to the last
    /// [`Self::close`] otherwise.
    pub fn remove(&self, cwd: u32, path: &str) -> FsResult<()> {
        let _guard = self.mutation_lock.lock();
        let (parent_str, name) = path::split(path);
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::NotFound);
        }
        let parent_sector = self.resolve_dir(cwd, parent_str)?;
        let mut parent_disk = self.load_inode(parent_sector);
        let target_sector = dir::lookup(&self.cache, &parent_disk, name).ok_or(FsError::NotFound)?;
        let target_disk = self.load_inode(target_sector);
        if target_disk.is_dir() && !dir::is_empty(&self.cache, &target_disk) {
            return Err(FsError::DirectoryNotEmpty);
        }

        dir::remove_entry(&self.cache, &self.freemap, &mut parent_disk, name)?;
        self.store_inode(parent_sector, &parent_disk);

        let freed_now = {
            let mut table = self.table.lock();
            match table.get_mut(&target_sector) {
                Some(entry) => {
                    entry.removed = true;
                    false
                }
                None => true,
            }
        };
        if freed_now {
            inode::free_tree(&self.cache, &self.freemap, &target_disk.blocks, target_disk.depth);
            self.freemap.free(target_sector);
        }
        self.sync();
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes copied; fewer than requested signals end-of-file.
    pub fn read_at(&self, inode: &Inode, buf: &mut [u8], offset: usize) -> usize {
        let disk = self.load_inode(inode.sector);
        let len = buf.len();
        inode::read_at(&self.cache, &disk, buf, len, offset)
    }

    /// Writes `buf` at `offset`, growing the file as needed.
    pub fn write_at(&self, inode: &Inode, buf: &[u8], offset: usize) -> FsResult<usize> {
        let _guard = self.mutation_lock.lock();
        if self.write_denied(inode.sector) {
            return Err(FsError::WriteDenied);
        }
        let mut disk = self.load_inode(inode.sector);
        let n = inode::write_at(&self.cache, &self.freemap, &mut disk, buf, buf.len(), offset)?;
        self.store_inode(inode.sector, &disk);
        self.sync();
        Ok(n)
    }

    /// Reads directly through a raw inode sector, bypassing the open-file
    /// table. Used by memory-mapped and executable pages, which track
    /// their own open lifetime separately from this call.
    pub fn read_raw_at(&self, sector: u32, buf: &mut [u8], offset: usize) -> usize {
        let disk = self.load_inode(sector);
        let len = buf.len();
        inode::read_at(&self.cache, &disk, buf, len, offset)
    }

    /// As [`Self::read_raw_at`], for write-back of dirty mapped pages.
    pub fn write_raw_at(&self, sector: u32, buf: &[u8], offset: usize) -> FsResult<usize> {
        let _guard = self.mutation_lock.lock();
        let mut disk = self.load_inode(sector);
        let n = inode::write_at(&self.cache, &self.freemap, &mut disk, buf, buf.len(), offset)?;
        self.store_inode(sector, &disk);
        self.sync();
        Ok(n)
    }

    /// Current file length in bytes.
    pub fn length(&self, inode: &Inode) -> usize {
        self.load_inode(inode.sector).len()
    }

    pub fn is_dir(&self, inode: &Inode) -> bool {
        self.load_inode(inode.sector).is_dir()
    }

    /// Lists a directory's entries as `(name, inode_sector)` pairs.
    pub fn readdir(&self, inode: &Inode) -> FsResult<Vec<(String, u32)>> {
        let disk = self.load_inode(inode.sector);
        if !disk.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(dir::list(&self.cache, &disk))
    }

    pub fn root(&self) -> Inode {
        self.iget(self.root_sector)
    }
}
