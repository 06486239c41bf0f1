//! Fixed-size object pool in shared memory.
//!
//! A pool hands out pointer-identified objects from pre-reserved memzone
//! chunks. Free objects live in a pluggable backend - a shared lock-free
//! ring by default - fronted by optional per-lcore caches. Because pools,
//! their backends and their objects all live at stable virtual addresses,
//! any process of the instance can get and put objects.
//!
//! Backends are dispatched through a process-local table addressed by the
//! index stored in the shared pool, never by function pointer, so the
//! mechanism survives the process boundary.
//!
//! # Example
//!
//! ```no_run
//! use shmem_pool::{Mempool, PoolFlags};
//!
//! let mp = Mempool::create("mbufs", 1023, 2048, 32, 0, None, None,
//!     shmem_rt::SOCKET_ID_ANY, PoolFlags::empty()).unwrap();
//!
//! let obj = mp.get().unwrap();
//! assert!(std::ptr::eq(unsafe { Mempool::from_obj(obj) }, mp));
//! mp.put(obj);
//! assert!(mp.is_full());
//! ```

mod cache;
mod mempool;
pub mod ops;

pub use cache::{Cache, CACHE_MAX_SIZE};
pub use mempool::{
    calc_obj_size, Mempool, ObjSize, PoolError, PoolFlags, PoolStats, POOL_MZ_PREFIX,
};
pub use ops::{lookup_ops, register_ops, PoolOps, MAX_OPS};
