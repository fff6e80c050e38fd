//! Tunable constants and the reference configuration.
//!
//! Kept as a flat list of `pub const`s compiled into every binary, the
//! way a kernel keeps them, but also collected into a [`Params`] struct
//! so tests can build small file systems and small frame pools instead
//! of the full-size reference ones.

/// Sector size in bytes, as exposed by `block_size(dev)`.
pub const SECTOR_SIZE: usize = 512;

/// Page size in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per page: `PGSIZE / SECTOR_SIZE`.
pub const PAGE_SECTOR_COUNT: usize = PGSIZE / SECTOR_SIZE;

/// Number of direct block pointers in an on-disk inode.
///
/// Chosen so that `InodeDisk` exactly fills one sector.
pub const NDIRECT: usize = 124;

/// Maximum directory-entry name length, not counting the NUL terminator.
pub const NAME_MAX: usize = 14;

/// Inode on-disk magic number, ASCII `"INOD"`.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Cap on inode tree depth. The field that counts it is unsigned, but no
/// realistic device size ever needs a depth beyond this.
pub const MAX_DEPTH: u32 = 3;

/// Default number of entries in the block cache.
pub const NBUF: usize = 64;

/// Default number of physical frames backing user memory.
pub const NFRAMES: usize = 64;

/// Number of ticks between forced block-cache flushes.
pub const FLUSH_INTERVAL_TICKS: u64 = 10_000;

/// Open files per process (fd 0 and 1 are reserved).
pub const NOFILE: usize = 128;

/// Bytes the stack-growth heuristic will grow below `esp`.
pub const STACK_GROWTH_SLACK: usize = 32;

/// Runtime-configurable sizes for a file system + VM instance.
///
/// Tests construct smaller instances via [`Params::small`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Params {
    pub sector_size: usize,
    pub page_sector_count: usize,
    pub cache_entries: usize,
    pub nframes: usize,
}

impl Params {
    /// The reference configuration (512-byte sectors, 8 sectors/page,
    /// 64-entry cache, 64 frames). `NDIRECT` is not configurable: it is
    /// baked into `InodeDisk`'s on-disk layout.
    pub const fn reference() -> Self {
        Self {
            sector_size: SECTOR_SIZE,
            page_sector_count: PAGE_SECTOR_COUNT,
            cache_entries: NBUF,
            nframes: NFRAMES,
        }
    }

    /// A small configuration for fast unit tests: same sector/page geometry,
    /// but a tiny cache and frame pool so eviction paths are easy to force.
    pub const fn small() -> Self {
        Self {
            sector_size: SECTOR_SIZE,
            page_sector_count: PAGE_SECTOR_COUNT,
            cache_entries: 4,
            nframes: 4,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::reference()
    }
}
