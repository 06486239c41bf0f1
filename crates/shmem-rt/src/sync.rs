//! Locks that are valid inside the cross-process mapping.
//!
//! `std::sync` primitives carry process-local state (parking lots, poison
//! flags) and must not live in shared memory. The two locks here are plain
//! atomic words: a zeroed word is an unlocked lock, which is exactly what a
//! freshly truncated configuration file provides.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Test-and-set spinlock.
#[repr(C)]
pub struct ShmSpinLock {
    locked: AtomicU32,
}

impl ShmSpinLock {
    /// Acquires the lock, spinning with adaptive backoff.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(0, Ordering::Release);
    }

    /// Runs `f` under the lock.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }
}

/// Readers/writer lock: the counter holds the number of active readers, or
/// -1 while a writer is inside.
#[repr(C)]
pub struct ShmRwLock {
    cnt: AtomicI32,
}

impl ShmRwLock {
    pub fn read_lock(&self) {
        let backoff = Backoff::new();
        loop {
            let cur = self.cnt.load(Ordering::Relaxed);
            if cur >= 0
                && self
                    .cnt
                    .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    pub fn read_unlock(&self) {
        self.cnt.fetch_sub(1, Ordering::Release);
    }

    pub fn write_lock(&self) {
        let backoff = Backoff::new();
        while self
            .cnt
            .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    pub fn write_unlock(&self) {
        self.cnt.store(0, Ordering::Release);
    }

    /// Runs `f` while holding the lock shared.
    pub fn with_read<R>(&self, f: impl FnOnce() -> R) -> R {
        self.read_lock();
        let r = f();
        self.read_unlock();
        r
    }

    /// Runs `f` while holding the lock exclusive.
    pub fn with_write<R>(&self, f: impl FnOnce() -> R) -> R {
        self.write_lock();
        let r = f();
        self.write_unlock();
        r
    }
}
