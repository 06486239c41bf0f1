//! Ring behavior against a live runtime: creation in memzones, discovery,
//! bulk/burst boundary behavior, fill/empty cycles.

use shmem_ring::{Ring, RingError, RingFlags};
use shmem_rt::InternalConfig;
use std::sync::{Once, OnceLock};

const RING_SIZE: u32 = 4096;
const MAX_BULK: usize = 32;

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        static DIR: OnceLock<std::path::PathBuf> = OnceLock::new();
        let dir = DIR
            .get_or_init(|| tempfile::tempdir().unwrap().into_path())
            .clone();
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 64 * 1024 * 1024;
        cfg.file_prefix = format!("ring_{}", std::process::id());
        cfg.runtime_dir = Some(dir);
        shmem_rt::init_with(cfg).unwrap();
    });
}

fn ptrs(n: usize) -> Vec<*mut u8> {
    (1..=n).map(|i| i as *mut u8).collect()
}

#[test]
fn sp_sc_basic_sequence() {
    setup();
    let r = Ring::create(
        "basic",
        RING_SIZE,
        shmem_rt::SOCKET_ID_ANY,
        RingFlags::SP_ENQ | RingFlags::SC_DEQ,
    )
    .unwrap();
    assert!(r.is_empty());
    assert_eq!(r.free_count(), RING_SIZE - 1);

    // Enqueue 1, then 2, then MAX_BULK pointers; dequeue in the same
    // pattern. The dequeued sequence must equal the enqueued one.
    let src = ptrs(3 + MAX_BULK);
    assert_eq!(r.enqueue_bulk(&src[..1]), 1);
    assert_eq!(r.enqueue_bulk(&src[1..3]), 2);
    assert_eq!(r.enqueue_bulk(&src[3..]), MAX_BULK);

    let mut dst = vec![std::ptr::null_mut(); src.len()];
    assert_eq!(r.dequeue_bulk(&mut dst[..1]), 1);
    assert_eq!(r.dequeue_bulk(&mut dst[1..3]), 2);
    assert_eq!(r.dequeue_bulk(&mut dst[3..]), MAX_BULK);
    assert_eq!(src, dst);
    assert!(r.is_empty());
}

#[test]
fn fill_to_capacity_and_drain() {
    setup();
    let r = Ring::create(
        "fill",
        RING_SIZE,
        shmem_rt::SOCKET_ID_ANY,
        RingFlags::SP_ENQ | RingFlags::SC_DEQ,
    )
    .unwrap();

    let batch = ptrs(MAX_BULK);
    let mut accepted = 0usize;
    loop {
        let n = r.enqueue_burst(&batch);
        accepted += n;
        if n < MAX_BULK {
            break;
        }
    }
    assert_eq!(accepted, RING_SIZE as usize - 1);
    assert!(r.is_full());
    assert!(!r.is_empty());
    assert_eq!(r.count(), RING_SIZE - 1);
    assert_eq!(r.free_count(), 0);

    let mut out = vec![std::ptr::null_mut(); MAX_BULK];
    let mut drained = 0usize;
    loop {
        let n = r.dequeue_burst(&mut out);
        if n == 0 {
            break;
        }
        drained += n;
    }
    assert_eq!(drained, accepted);
    assert!(r.is_empty());
    assert!(!r.is_full());
}

#[test]
fn standard_vs_exact_size_capacity() {
    setup();
    let std_ring = Ring::create("cap_std", 16, shmem_rt::SOCKET_ID_ANY, RingFlags::empty())
        .unwrap();
    let exact_ring = Ring::create(
        "cap_exact",
        16,
        shmem_rt::SOCKET_ID_ANY,
        RingFlags::EXACT_SZ,
    )
    .unwrap();

    // Standard mode spends one slot on the full/empty sentinel.
    for _ in 0..15 {
        std_ring.enqueue(std::ptr::null_mut()).unwrap();
    }
    assert_eq!(
        std_ring.enqueue(std::ptr::null_mut()),
        Err(RingError::Full)
    );

    // Exact-size mode accepts the requested count.
    for _ in 0..16 {
        exact_ring.enqueue(std::ptr::null_mut()).unwrap();
    }
    assert_eq!(
        exact_ring.enqueue(std::ptr::null_mut()),
        Err(RingError::Full)
    );
    assert_eq!(exact_ring.size(), 32);
    assert_eq!(exact_ring.capacity(), 16);
}

#[test]
fn lookup_and_name_collision() {
    setup();
    let r = Ring::create("disc", 64, shmem_rt::SOCKET_ID_ANY, RingFlags::empty()).unwrap();
    let found = Ring::lookup("disc").unwrap();
    assert!(std::ptr::eq(r, found));
    assert_eq!(found.name(), "disc");

    assert!(matches!(
        Ring::create("disc", 64, shmem_rt::SOCKET_ID_ANY, RingFlags::empty()),
        Err(RingError::AlreadyExists(_))
    ));
    assert!(matches!(Ring::lookup("absent"), Err(RingError::NotFound(_))));
}

#[test]
fn invalid_sizes_rejected() {
    setup();
    assert!(matches!(
        Ring::create("bad1", 24, shmem_rt::SOCKET_ID_ANY, RingFlags::empty()),
        Err(RingError::InvalidArgument(_))
    ));
    assert!(matches!(
        Ring::create("bad2", 0, shmem_rt::SOCKET_ID_ANY, RingFlags::empty()),
        Err(RingError::InvalidArgument(_))
    ));
}

#[test]
fn free_releases_the_name() {
    setup();
    let r = Ring::create("transient", 128, shmem_rt::SOCKET_ID_ANY, RingFlags::empty())
        .unwrap();
    r.enqueue(0xdead as *mut u8).unwrap();
    Ring::free(r).unwrap();
    assert!(matches!(
        Ring::lookup("transient"),
        Err(RingError::NotFound(_))
    ));
    // The name is reusable immediately.
    let r2 = Ring::create("transient", 128, shmem_rt::SOCKET_ID_ANY, RingFlags::empty())
        .unwrap();
    assert!(r2.is_empty());
    Ring::free(r2).unwrap();
}

#[test]
fn mp_mc_through_shared_zone() {
    setup();
    let r = Ring::create("soak", 256, shmem_rt::SOCKET_ID_ANY, RingFlags::empty()).unwrap();

    const PER_PRODUCER: usize = 10_000;
    const PRODUCERS: usize = 3;
    std::thread::scope(|s| {
        for p in 0..PRODUCERS {
            s.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let val = (p * PER_PRODUCER + i + 1) as *mut u8;
                    while r.enqueue_bulk(&[val]) == 0 {
                        std::hint::spin_loop();
                    }
                }
            });
        }
        let collector = s.spawn(move || {
            let mut got = vec![false; PRODUCERS * PER_PRODUCER + 1];
            let mut out = vec![std::ptr::null_mut(); 64];
            let mut total = 0;
            while total < PRODUCERS * PER_PRODUCER {
                let n = r.dequeue_burst(&mut out);
                for &ptr in &out[..n] {
                    let v = ptr as usize;
                    assert!(!got[v], "value {v} delivered twice");
                    got[v] = true;
                }
                total += n;
            }
            total
        });
        assert_eq!(collector.join().unwrap(), PRODUCERS * PER_PRODUCER);
    });
    assert!(r.is_empty());
}
