//! Two-process object exchange over one shared pool.
//!
//! A producer process draws objects from an SP-put/SC-get pool and pushes
//! them through a shared ring; when the pool runs dry it falls back to a
//! dynamic bump area in a separate memzone, tagging those objects. The
//! consumer returns pool objects to the pool and releases dynamic ones. At
//! quiescence the pool is full again and no dynamic allocation is
//! outstanding.
//!
//! Run with runtime options (e.g. `demo --huge-dir /dev/hugepages -m 64`)
//! to exercise real huge pages; with no arguments an anonymous-memory
//! instance is used and the second process is forked so it inherits the
//! mappings (anonymous segments cannot be attached by an unrelated
//! process).

use shmem_pool::{Mempool, PoolFlags};
use shmem_ring::{Ring, RingFlags};
use shmem_rt::{memzone, InternalConfig, MemzoneFlags};
use std::sync::atomic::{AtomicUsize, Ordering};

const POOL_OBJS: u32 = 64;
const OBJ_SIZE: u32 = 64;
const RING_SIZE: u32 = 256;
const EXCHANGES: u64 = 4096;

const TAG_POOL: u64 = 0;
const TAG_DYNAMIC: u64 = 1;

/// Bump allocator living at the head of a shared zone.
#[repr(C)]
struct DynArea {
    cursor: AtomicUsize,
    outstanding: AtomicUsize,
    limit: usize,
}

impl DynArea {
    fn init(mz: &shmem_rt::MemZone) -> &'static DynArea {
        // SAFETY: fresh zone, sized well above the header.
        unsafe {
            let area = mz.as_ptr().cast::<DynArea>();
            (*area).cursor = AtomicUsize::new(std::mem::size_of::<DynArea>());
            (*area).outstanding = AtomicUsize::new(0);
            (*area).limit = mz.len;
            &*area
        }
    }

    fn alloc(&self, len: usize) -> Option<*mut u8> {
        let len = (len + 63) & !63;
        let off = self.cursor.fetch_add(len, Ordering::Relaxed);
        if off + len > self.limit {
            return None;
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        // SAFETY: the span [off, off+len) is exclusively ours.
        Some(unsafe { (self as *const Self as *mut u8).add(off) })
    }

    fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

fn write_obj(obj: *mut u8, tag: u64, seq: u64) {
    // SAFETY: objects are at least 16 bytes.
    unsafe {
        obj.cast::<u64>().write(tag);
        obj.cast::<u64>().add(1).write(seq);
    }
}

fn read_obj(obj: *mut u8) -> (u64, u64) {
    // SAFETY: written by `write_obj` before the ring handoff.
    unsafe { (obj.cast::<u64>().read(), obj.cast::<u64>().add(1).read()) }
}

fn producer(mp: &Mempool, ring: &Ring, dyn_area: &DynArea) {
    let mut from_pool = 0u64;
    for seq in 0..EXCHANGES {
        let (obj, tag) = match mp.get() {
            Ok(obj) => {
                from_pool += 1;
                (obj, TAG_POOL)
            }
            Err(_) => {
                let obj = dyn_area
                    .alloc(OBJ_SIZE as usize)
                    .expect("dynamic area exhausted");
                (obj, TAG_DYNAMIC)
            }
        };
        write_obj(obj, tag, seq);
        while ring.enqueue(obj).is_err() {
            std::hint::spin_loop();
        }
    }
    println!(
        "producer: sent {EXCHANGES} objects ({from_pool} pooled, {} dynamic)",
        EXCHANGES - from_pool
    );
}

fn consumer(mp: &Mempool, ring: &Ring, dyn_area: &DynArea) {
    let mut expected = 0u64;
    while expected < EXCHANGES {
        let Ok(obj) = ring.dequeue() else {
            std::hint::spin_loop();
            continue;
        };
        let (tag, seq) = read_obj(obj);
        assert_eq!(seq, expected, "single producer must arrive in order");
        expected += 1;
        match tag {
            TAG_POOL => mp.put(obj),
            TAG_DYNAMIC => dyn_area.release(),
            other => panic!("corrupt tag {other}"),
        }
    }
    println!("consumer: received {expected} objects");
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 64 * 1024 * 1024;
        cfg.file_prefix = format!("demo_{}", std::process::id());
        shmem_rt::init_with(cfg).expect("runtime init");
    } else {
        shmem_rt::init(args).expect("runtime init");
    }

    let mp = Mempool::create(
        "demo",
        POOL_OBJS,
        OBJ_SIZE,
        0,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::SP_PUT | PoolFlags::SC_GET,
    )
    .expect("pool");
    let ring = Ring::create(
        "demo_xfer",
        RING_SIZE,
        shmem_rt::SOCKET_ID_ANY,
        RingFlags::SP_ENQ | RingFlags::SC_DEQ,
    )
    .expect("ring");
    let dyn_mz = memzone::reserve(
        "demo_dyn",
        1024 * 1024,
        shmem_rt::SOCKET_ID_ANY,
        MemzoneFlags::empty(),
    )
    .expect("dynamic area");
    let dyn_area = DynArea::init(dyn_mz);

    // SAFETY: single-threaded at this point; the child inherits the shared
    // mappings at identical addresses.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        producer(mp, ring, dyn_area);
        std::process::exit(0);
    }

    consumer(mp, ring, dyn_area);
    let mut status = 0;
    // SAFETY: pid is our child.
    unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(status, 0, "producer exited abnormally");

    assert_eq!(mp.avail_count(), mp.size(), "pool must be full again");
    assert_eq!(
        dyn_area.outstanding.load(Ordering::Relaxed),
        0,
        "all dynamic objects must be released"
    );
    println!(
        "quiescent: pool {}/{} available, 0 dynamic outstanding",
        mp.avail_count(),
        mp.size()
    );
}
