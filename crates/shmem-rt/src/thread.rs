//! Per-thread runtime state.
//!
//! Every thread caches its lcore id, NUMA id and cpuset in thread-local
//! storage so the data path never touches the shared tables. Threads that
//! were never registered keep [`LCORE_ID_ANY`] and are served the slow path
//! (no per-CPU cache, socket = ANY).

use crate::config::{LCORE_ID_ANY, MAX_LCORE, SOCKET_ID_ANY};
use crate::RtError;
use log::error;
use std::cell::{Cell, RefCell};

thread_local! {
    static LCORE_ID: Cell<u32> = const { Cell::new(LCORE_ID_ANY) };
    static SOCKET_ID: Cell<i32> = const { Cell::new(SOCKET_ID_ANY) };
    static CPUSET: RefCell<libc::cpu_set_t> = RefCell::new(unsafe { std::mem::zeroed() });
}

/// Lcore id of the calling thread, [`LCORE_ID_ANY`] for unregistered threads.
#[inline]
pub fn lcore_id() -> u32 {
    LCORE_ID.with(Cell::get)
}

/// NUMA node of the calling thread, [`SOCKET_ID_ANY`] when unknown or mixed.
#[inline]
pub fn socket_id() -> i32 {
    SOCKET_ID.with(Cell::get)
}

/// Copy of the calling thread's cached cpuset.
pub fn get_affinity() -> libc::cpu_set_t {
    CPUSET.with(|c| *c.borrow())
}

/// NUMA node common to every CPU in the set, or ANY when they disagree.
pub(crate) fn cpuset_socket_id(set: &libc::cpu_set_t) -> i32 {
    let mut socket_id = SOCKET_ID_ANY;
    for cpu in 0..MAX_LCORE {
        // SAFETY: cpu < CPU_SETSIZE by the MAX_LCORE bound.
        if !unsafe { libc::CPU_ISSET(cpu, set) } {
            continue;
        }
        let sid = crate::cpu_config()
            .map(|c| c.lcore(cpu as u32).socket_id as i32)
            .unwrap_or(SOCKET_ID_ANY);
        if socket_id == SOCKET_ID_ANY {
            socket_id = sid;
        } else if socket_id != sid {
            return SOCKET_ID_ANY;
        }
    }
    socket_id
}

/// Pins the calling thread to `set` and refreshes all thread-local state.
///
/// When the thread carries a valid lcore id, the new cpuset and socket are
/// also mirrored into the shared lcore table.
pub fn set_affinity(set: &libc::cpu_set_t) -> Result<(), RtError> {
    // SAFETY: pthread_self is always valid; set points at a full cpu_set_t.
    let rc = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            set,
        )
    };
    if rc != 0 {
        error!(target: "eal", "pthread_setaffinity_np failed: {rc}");
        return Err(RtError::fatal("cannot set thread affinity"));
    }

    let socket = cpuset_socket_id(set);
    SOCKET_ID.with(|s| s.set(socket));
    CPUSET.with(|c| *c.borrow_mut() = *set);

    let lcore = lcore_id();
    if lcore != LCORE_ID_ANY {
        let cpu = crate::cpu_config()?;
        // SAFETY: only the owning thread of an lcore writes its slot after
        // init; this thread owns `lcore`.
        unsafe {
            let slot = &mut *cpu.lcore_slot(lcore);
            slot.socket_id = if socket < 0 { 0 } else { socket as u32 };
            slot.cpuset = *set;
        }
    }
    Ok(())
}

/// Registers the calling thread as `lcore_id` and pins it to that lcore's
/// cpuset. Called for the master thread at init.
pub(crate) fn init_thread(lcore_id: u32) -> Result<(), RtError> {
    LCORE_ID.with(|c| c.set(lcore_id));
    let set = crate::cpu_config()?.lcore(lcore_id).cpuset;
    set_affinity(&set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_thread_defaults() {
        std::thread::spawn(|| {
            assert_eq!(lcore_id(), LCORE_ID_ANY);
            assert_eq!(socket_id(), SOCKET_ID_ANY);
        })
        .join()
        .unwrap();
    }
}
