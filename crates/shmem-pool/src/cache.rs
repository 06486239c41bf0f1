//! Per-lcore object cache.
//!
//! A cache belongs to exactly one thread. The inline slot array is sized to
//! three times the maximum cache size so a put burst can overflow past the
//! steady-state `size` up to `flush_threshold` before the excess is drained
//! to the backend in one bulk enqueue. Gets are served from the top of the
//! array, LIFO, which keeps recently returned objects hot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Compile-time ceiling on the steady-state cache size.
pub const CACHE_MAX_SIZE: u32 = 512;

/// Inline slot count; allows bursts past the flush threshold.
const CACHE_SLOTS: usize = CACHE_MAX_SIZE as usize * 3;

/// Flush threshold: 1.5x the steady-state size.
fn flush_threshold(size: u32) -> u32 {
    size + size / 2
}

/// A per-thread object cache, either inline in the pool's memzone (one per
/// lcore) or caller-owned for unregistered threads.
///
/// Not `Sync`: a cache must never be shared between threads. The `len`
/// counter is still readable cross-thread (relaxed) so the inspection-only
/// counters can sum it.
#[repr(C)]
pub struct Cache {
    size: u32,
    flushthresh: u32,
    len: AtomicU32,
    objs: UnsafeCell<[usize; CACHE_SLOTS]>,
}

impl Cache {
    /// Initializes a cache in place (zeroed shared memory).
    ///
    /// # Safety
    /// `ptr` must point at writable memory of at least
    /// `size_of::<Cache>()` bytes, not yet visible to any other thread.
    pub(crate) unsafe fn init_at(ptr: *mut Cache, size: u32) {
        (*ptr).size = size;
        (*ptr).flushthresh = flush_threshold(size);
        (*ptr).len = AtomicU32::new(0);
    }

    /// A caller-owned cache for threads without an lcore id.
    pub fn user_owned(size: u32) -> Result<Box<Cache>, crate::PoolError> {
        if size == 0 || size > CACHE_MAX_SIZE {
            return Err(crate::PoolError::InvalidArgument(format!(
                "cache size {size} not in 1..={CACHE_MAX_SIZE}"
            )));
        }
        Ok(Box::new(Cache {
            size,
            flushthresh: flush_threshold(size),
            len: AtomicU32::new(0),
            objs: UnsafeCell::new([0; CACHE_SLOTS]),
        }))
    }

    /// Steady-state fill size.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Overflow limit before a drain.
    #[inline]
    pub fn flush_threshold(&self) -> u32 {
        self.flushthresh
    }

    /// Current number of cached objects.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub(crate) fn set_len(&self, len: u32) {
        debug_assert!(len as usize <= CACHE_SLOTS);
        self.len.store(len, Ordering::Relaxed);
    }

    /// Raw slot pointer. The owning thread is the only writer.
    #[inline]
    pub(crate) fn objs_ptr(&self) -> *mut usize {
        self.objs.get().cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_owned_validates_size() {
        assert!(Cache::user_owned(0).is_err());
        assert!(Cache::user_owned(CACHE_MAX_SIZE + 1).is_err());
        let c = Cache::user_owned(32).unwrap();
        assert_eq!(c.size(), 32);
        assert_eq!(c.flush_threshold(), 48);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn threshold_allows_overflow() {
        let c = Cache::user_owned(CACHE_MAX_SIZE).unwrap();
        assert_eq!(c.flush_threshold(), 768);
        assert!(c.flush_threshold() as usize <= CACHE_SLOTS);
    }
}
