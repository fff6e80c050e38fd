//! Short critical sections: frame-table membership, block-cache metadata,
//! the swap bitmap.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// A lock for critical sections that must never block on I/O.
///
/// Held only across plain memory operations, never across a disk transfer.
pub struct SpinLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

pub struct SpinLockGuard<'s, T> {
    inner: MutexGuard<'s, T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|e| panic!("{} poisoned: {e}", self.name));
        SpinLockGuard { inner }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
