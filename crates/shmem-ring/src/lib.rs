//! Bounded lock-free FIFO of pointer-sized slots, living in a named memory
//! zone so any process of the instance can produce into and consume from it.
//!
//! Single/multi producer and consumer modes are chosen at construction;
//! every operation comes in *bulk* (all-or-nothing) and *burst* (as many as
//! fit) variants.
//!
//! # Example
//!
//! ```no_run
//! use shmem_ring::{Ring, RingFlags};
//!
//! let r = Ring::create("events", 1024, shmem_rt::SOCKET_ID_ANY,
//!     RingFlags::empty()).unwrap();
//! let objs = [0x1000 as *mut u8, 0x2000 as *mut u8];
//! assert_eq!(r.enqueue_bulk(&objs), 2);
//!
//! let mut out = [std::ptr::null_mut(); 2];
//! assert_eq!(r.dequeue_bulk(&mut out), 2);
//! assert_eq!(out[0], 0x1000 as *mut u8);
//! ```

mod ring;

pub use ring::{Ring, RingError, RingFlags, RING_MZ_PREFIX, RING_SZ_MASK};
