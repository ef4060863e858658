//! `Latch`: the named synchronization wrapper the Scheduler and
//! IOManager build on.
//!
//! Grounded on the teacher's `fiber::Latch`/`LatchGuard` (itself an RAII
//! wrapper around Tarantool's `box_latch_*` C API) and on sylar's
//! `Mutex`/`RWMutex` (`thread.h`), which are plain `pthread_mutex_t` /
//! `pthread_rwlock_t` wrappers used exactly where spec.md §5 calls for
//! "one mutex" (the scheduler queue) and a "read/write lock" (the
//! FdContext vector). There is no cooperative-yield-aware mutex here —
//! unlike Tarantool's fiber-aware latch, this core's fibers never block
//! on a latch while holding it across a yield point (see spec.md §5,
//! "held only across queue mutation and the affinity scan") — so a
//! plain `std::sync::Mutex`/`RwLock` is the correct, idiomatic stand-in;
//! `Latch`/`RwLatch` just give them the teacher's vocabulary and an
//! RAII guard shape consistent with the rest of the crate.
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A mutex protecting a single piece of scheduler state (the work
/// queue, a per-fd context).
pub struct Latch<T> {
    inner: Mutex<T>,
}

impl<T> Latch<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Locks the latch, blocking the calling OS thread (not a
    /// cooperative yield) until it is available.
    pub fn lock(&self) -> LatchGuard<'_, T> {
        LatchGuard { guard: self.inner.lock().unwrap_or_else(|e| e.into_inner()) }
    }
}

pub struct LatchGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for LatchGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for LatchGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A read/write lock protecting state that is read far more often than
/// it is grown, used by the IOManager's FdContext vector (spec.md §4.3:
/// "Under a read lock, if fd >= vector size, acquire the write lock and
/// grow").
pub struct RwLatch<T> {
    inner: RwLock<T>,
}

impl<T> RwLatch<T> {
    pub fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
