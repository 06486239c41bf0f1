//! Process-local table of pool backends.
//!
//! A pool stores an *index* into this table, never a function pointer, so a
//! secondary process can run the same pool through its own table. That only
//! works when every process registers the same backends in the same order:
//! the four ring backends are pre-registered here at fixed indices, and any
//! further [`register_ops`] calls must be made in matching order across
//! processes (looking the index up with [`lookup_ops`] before first use is
//! the safe pattern).

use crate::{Mempool, PoolError};
use shmem_ring::{Ring, RingFlags};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

/// Compile-time ceiling on registered backends.
pub const MAX_OPS: usize = 16;

/// A set of backend callbacks.
///
/// `alloc`, `enqueue`, `dequeue` and `get_count` are mandatory; `free` is
/// optional. Registration rejects incomplete sets.
#[derive(Clone, Copy)]
pub struct PoolOps {
    pub name: &'static str,
    /// Create the backend state and store it via
    /// [`Mempool::set_pool_data`].
    pub alloc: Option<fn(&Mempool) -> Result<(), PoolError>>,
    /// Tear the backend state down.
    pub free: Option<fn(&Mempool)>,
    /// Return objects to the backend.
    pub enqueue: Option<fn(&Mempool, &[*mut u8]) -> Result<(), PoolError>>,
    /// Take objects from the backend, all or nothing.
    pub dequeue: Option<fn(&Mempool, &mut [*mut u8]) -> Result<(), PoolError>>,
    /// Objects currently available in the backend.
    pub get_count: Option<fn(&Mempool) -> u32>,
}

struct OpsTable {
    /// Serializes registration; reads go through `count` alone.
    reg_lock: Mutex<()>,
    count: AtomicUsize,
    slots: [UnsafeCell<MaybeUninit<PoolOps>>; MAX_OPS],
}

// SAFETY: slots are written once, before `count` is advanced with Release;
// readers only touch slots below the Acquire-loaded count.
unsafe impl Sync for OpsTable {}

static TABLE: OpsTable = OpsTable {
    reg_lock: Mutex::new(()),
    count: AtomicUsize::new(0),
    slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; MAX_OPS],
};

fn register_locked(ops: &PoolOps) -> Result<usize, PoolError> {
    if ops.alloc.is_none()
        || ops.enqueue.is_none()
        || ops.dequeue.is_none()
        || ops.get_count.is_none()
    {
        return Err(PoolError::InvalidArgument(format!(
            "backend {:?} is missing a mandatory callback",
            ops.name
        )));
    }
    if ops.name.is_empty() || ops.name.len() >= shmem_rt::NAMESIZE {
        return Err(PoolError::InvalidArgument(format!(
            "backend name {:?} too long",
            ops.name
        )));
    }

    let _guard = TABLE.reg_lock.lock().unwrap();
    let count = TABLE.count.load(Ordering::Relaxed);
    for idx in 0..count {
        // SAFETY: slots below count are initialized.
        let existing = unsafe { (*TABLE.slots[idx].get()).assume_init_ref() };
        if existing.name == ops.name {
            return Err(PoolError::AlreadyExists(ops.name.to_owned()));
        }
    }
    if count >= MAX_OPS {
        return Err(PoolError::NoSpace(
            "maximum number of pool backends exceeded".into(),
        ));
    }
    // SAFETY: the slot at `count` is unpublished; we hold the lock.
    unsafe { (*TABLE.slots[count].get()).write(*ops) };
    TABLE.count.store(count + 1, Ordering::Release);
    Ok(count)
}

fn ensure_defaults() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        for ops in [&RING_MP_MC, &RING_SP_SC, &RING_MP_SC, &RING_SP_MC] {
            register_locked(ops).expect("default backend registration");
        }
    });
}

/// Registers a backend, returning its table index.
///
/// Registration is append-only and capped at [`MAX_OPS`]; indices are
/// stable for the process lifetime.
pub fn register_ops(ops: &PoolOps) -> Result<usize, PoolError> {
    ensure_defaults();
    register_locked(ops)
}

/// Index of a backend by name.
pub fn lookup_ops(name: &str) -> Option<usize> {
    ensure_defaults();
    let count = TABLE.count.load(Ordering::Acquire);
    (0..count).find(|&idx| {
        // SAFETY: slots below count are initialized and immutable.
        unsafe { (*TABLE.slots[idx].get()).assume_init_ref() }.name == name
    })
}

/// Backend callbacks for a stored index.
pub(crate) fn get_ops(ops_index: i32) -> Result<PoolOps, PoolError> {
    ensure_defaults();
    let count = TABLE.count.load(Ordering::Acquire);
    if ops_index < 0 || ops_index as usize >= count {
        return Err(PoolError::InvalidArgument(format!(
            "backend index {ops_index} out of range"
        )));
    }
    // SAFETY: slots below count are initialized and immutable.
    Ok(unsafe { *(*TABLE.slots[ops_index as usize].get()).assume_init_ref() })
}

// ---------------------------------------------------------------------
// Default backends: the shared ring in its four producer/consumer modes
// ---------------------------------------------------------------------

fn ring_of(mp: &Mempool) -> &'static Ring {
    // SAFETY: pool_data is set by ring_alloc before the pool is populated,
    // and points at a ring living in a shared memzone.
    unsafe { &*(mp.pool_data() as *const Ring) }
}

fn ring_alloc(mp: &Mempool) -> Result<(), PoolError> {
    let mut flags = RingFlags::empty();
    if mp.flags().contains(crate::PoolFlags::SP_PUT) {
        flags |= RingFlags::SP_ENQ;
    }
    if mp.flags().contains(crate::PoolFlags::SC_GET) {
        flags |= RingFlags::SC_DEQ;
    }
    // One slot above the object count, rounded up; the ring must hold the
    // whole pool.
    let count = (mp.size() + 1).next_power_of_two();
    let ring = Ring::create(
        &format!("{}{}", crate::POOL_MZ_PREFIX, mp.name()),
        count,
        mp.socket_id(),
        flags,
    )?;
    mp.set_pool_data(ring as *const Ring as usize);
    Ok(())
}

fn ring_free(mp: &Mempool) {
    let _ = Ring::free(ring_of(mp));
}

fn ring_mp_enqueue(mp: &Mempool, objs: &[*mut u8]) -> Result<(), PoolError> {
    if ring_of(mp).mp_enqueue_bulk(objs) == objs.len() {
        Ok(())
    } else {
        Err(PoolError::NoBuffers)
    }
}

fn ring_sp_enqueue(mp: &Mempool, objs: &[*mut u8]) -> Result<(), PoolError> {
    if ring_of(mp).sp_enqueue_bulk(objs) == objs.len() {
        Ok(())
    } else {
        Err(PoolError::NoBuffers)
    }
}

fn ring_mc_dequeue(mp: &Mempool, out: &mut [*mut u8]) -> Result<(), PoolError> {
    if ring_of(mp).mc_dequeue_bulk(out) == out.len() {
        Ok(())
    } else {
        Err(PoolError::NoObjects)
    }
}

fn ring_sc_dequeue(mp: &Mempool, out: &mut [*mut u8]) -> Result<(), PoolError> {
    if ring_of(mp).sc_dequeue_bulk(out) == out.len() {
        Ok(())
    } else {
        Err(PoolError::NoObjects)
    }
}

fn ring_count(mp: &Mempool) -> u32 {
    ring_of(mp).count()
}

pub(crate) static RING_MP_MC: PoolOps = PoolOps {
    name: "ring_mp_mc",
    alloc: Some(ring_alloc),
    free: Some(ring_free),
    enqueue: Some(ring_mp_enqueue),
    dequeue: Some(ring_mc_dequeue),
    get_count: Some(ring_count),
};

pub(crate) static RING_SP_SC: PoolOps = PoolOps {
    name: "ring_sp_sc",
    alloc: Some(ring_alloc),
    free: Some(ring_free),
    enqueue: Some(ring_sp_enqueue),
    dequeue: Some(ring_sc_dequeue),
    get_count: Some(ring_count),
};

pub(crate) static RING_MP_SC: PoolOps = PoolOps {
    name: "ring_mp_sc",
    alloc: Some(ring_alloc),
    free: Some(ring_free),
    enqueue: Some(ring_mp_enqueue),
    dequeue: Some(ring_sc_dequeue),
    get_count: Some(ring_count),
};

pub(crate) static RING_SP_MC: PoolOps = PoolOps {
    name: "ring_sp_mc",
    alloc: Some(ring_alloc),
    free: Some(ring_free),
    enqueue: Some(ring_sp_enqueue),
    dequeue: Some(ring_mc_dequeue),
    get_count: Some(ring_count),
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_registered_in_fixed_order() {
        assert_eq!(lookup_ops("ring_mp_mc"), Some(0));
        assert_eq!(lookup_ops("ring_sp_sc"), Some(1));
        assert_eq!(lookup_ops("ring_mp_sc"), Some(2));
        assert_eq!(lookup_ops("ring_sp_mc"), Some(3));
        assert_eq!(lookup_ops("nonexistent"), None);
    }

    #[test]
    fn incomplete_ops_rejected() {
        let ops = PoolOps {
            name: "broken",
            alloc: None,
            free: None,
            enqueue: Some(ring_mp_enqueue),
            dequeue: Some(ring_mc_dequeue),
            get_count: Some(ring_count),
        };
        assert!(matches!(
            register_ops(&ops),
            Err(PoolError::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut ops = RING_MP_MC;
        ops.name = "ring_mp_mc";
        assert!(matches!(
            register_ops(&ops),
            Err(PoolError::AlreadyExists(_))
        ));
    }
}
