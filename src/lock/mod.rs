//! Two lock wrappers that name the critical sections they're meant for,
//! even though both are backed by [`std::sync::Mutex`]: [`SpinLock`] for
//! short, memory-only sections (frame-table bookkeeping, cache metadata),
//! [`SleepLock`] for sections that may suspend inside block I/O (the
//! file-system mutation lock). Keeping them distinct types means a caller
//! can tell which discipline a given critical section follows just by
//! looking at the field type, without re-reading the body to check whether
//! it touches the device.

mod sleep;
mod spin;

pub use sleep::{SleepLock, SleepLockGuard};
pub use spin::{SpinLock, SpinLockGuard};
