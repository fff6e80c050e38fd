//! Demand-paged virtual memory: addresses, the page-mapping boundary, the
//! frame table, the supplemental page table, and memory-mapped files.

pub mod addr;
pub mod address_space;
pub mod frame;
pub mod mmap;
pub mod spt;

pub use addr::VirtAddr;
pub use address_space::{AddressSpace, HashedAddressSpace};
pub use frame::{FrameOwner, FrameTable};
pub use mmap::{mmap_file_create, mmap_file_destroy, Mmap};
pub use spt::{Spt, SptEntry, SptState, SptType};
