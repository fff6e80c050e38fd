//! Long critical sections that may suspend inside block I/O: the
//! file-system-wide mutation lock that serializes multi-step operations
//! like create/remove/write.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

/// A lock for critical sections that may block on disk I/O. Unlike
/// [`SpinLock`](super::SpinLock) it is safe to hold this across a
/// `read_sector`/`write_sector` call.
pub struct SleepLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

pub struct SleepLockGuard<'s, T> {
    inner: MutexGuard<'s, T>,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(|e| panic!("{} poisoned: {e}", self.name));
        SleepLockGuard { inner }
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}
