//! Pool behavior against a live runtime: accounting, caches, split
//! creation, backend selection and cross-thread exchange.

use shmem_pool::{Cache, Mempool, PoolError, PoolFlags, CACHE_MAX_SIZE};
use shmem_ring::{Ring, RingFlags};
use shmem_rt::InternalConfig;
use std::sync::{Once, OnceLock};

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        static DIR: OnceLock<std::path::PathBuf> = OnceLock::new();
        let dir = DIR
            .get_or_init(|| tempfile::tempdir().unwrap().into_path())
            .clone();
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 384 * 1024 * 1024;
        cfg.file_prefix = format!("pool_{}", std::process::id());
        cfg.runtime_dir = Some(dir);
        shmem_rt::init_with(cfg).unwrap();
    });
}

#[test]
fn uncached_pool_accounting() {
    setup();
    let lcores = shmem_rt::lcore::count().unwrap() as u32;
    let n = lcores * (16 + CACHE_MAX_SIZE) - 1;
    let mp = Mempool::create(
        "acct",
        n,
        2048,
        0,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();

    assert_eq!(mp.size(), n);
    assert_eq!(mp.populated_size(), n);
    assert_eq!(mp.avail_count(), n);
    assert_eq!(mp.in_use_count(), 0);
    assert!(mp.is_full());
    assert!(!mp.is_empty());

    let obj = mp.get().unwrap();
    assert_eq!(mp.avail_count(), n - 1);
    assert_eq!(mp.in_use_count(), 1);
    assert!(std::ptr::eq(unsafe { Mempool::from_obj(obj) }, mp));

    mp.put(obj);
    assert_eq!(mp.avail_count(), n);
    assert!(mp.is_full());

    Mempool::free(mp).unwrap();
}

#[test]
fn draining_the_pool_returns_no_objects() {
    setup();
    let mp = Mempool::create(
        "drain",
        64,
        128,
        0,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();

    let mut held = Vec::new();
    for _ in 0..64 {
        held.push(mp.get().unwrap());
    }
    assert!(mp.is_empty());
    assert_eq!(mp.get().unwrap_err(), PoolError::NoObjects);

    // Bulk larger than remaining is all-or-nothing.
    mp.put(held.pop().unwrap());
    let mut out = [std::ptr::null_mut(); 2];
    assert_eq!(mp.get_bulk(&mut out).unwrap_err(), PoolError::NoObjects);

    for obj in held.drain(..) {
        mp.put(obj);
    }
    assert_eq!(mp.avail_count(), 64);
    let mut one = [std::ptr::null_mut(); 1];
    mp.get_bulk(&mut one).unwrap();
    mp.put(one[0]);

    Mempool::free(mp).unwrap();
}

#[test]
fn user_cache_refill_and_flush() {
    setup();
    let mp = Mempool::create(
        "cached",
        1023,
        64,
        32,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();
    let size = mp.size();
    let cache = Cache::user_owned(32).unwrap();
    assert_eq!(cache.flush_threshold(), 48);

    // A short cache refills to steady state plus the request in one bulk
    // dequeue.
    let mut out = [std::ptr::null_mut(); 10];
    mp.generic_get(&mut out, Some(&cache)).unwrap();
    assert_eq!(cache.len(), 32);
    // User-owned caches are invisible to the counters.
    assert_eq!(mp.avail_count(), size - 42);

    // Returning below the flush threshold stays in the cache.
    mp.generic_put(&out, Some(&cache));
    assert_eq!(cache.len(), 42);
    assert_eq!(mp.avail_count(), size - 42);

    // Crossing the threshold drains back to the steady-state size.
    let mut direct = [std::ptr::null_mut(); 6];
    mp.generic_get(&mut direct, None).unwrap();
    mp.generic_put(&direct, Some(&cache));
    assert_eq!(cache.len(), 32);
    assert_eq!(mp.avail_count(), size - 32);

    mp.cache_flush(&cache);
    assert_eq!(cache.len(), 0);
    assert_eq!(mp.avail_count(), size);

    Mempool::free(mp).unwrap();
}

#[test]
fn unregistered_threads_have_no_default_cache() {
    setup();
    let mp = Mempool::create(
        "nocache_thread",
        255,
        64,
        16,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();

    std::thread::spawn(move || {
        assert!(mp.default_cache().is_none());
        // The direct path still works.
        let obj = mp.get().unwrap();
        mp.put(obj);
    })
    .join()
    .unwrap();

    Mempool::free(mp).unwrap();
}

#[test]
fn split_creation_populates_and_iterates() {
    setup();
    let mp = Mempool::create_empty(
        "split",
        128,
        256,
        0,
        0,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();
    assert_eq!(mp.populated_size(), 0);
    mp.set_ops_by_name("ring_sp_sc").unwrap();

    let added = mp.populate_default().unwrap();
    assert_eq!(added, 128);
    assert_eq!(mp.populated_size(), 128);
    assert_eq!(mp.avail_count(), 128);

    // Every populated object is distinct and reports the same owner.
    let mut seen = std::collections::HashSet::new();
    let visited = mp.obj_iter(|owner, obj, _| {
        assert!(std::ptr::eq(owner, mp));
        assert!(seen.insert(obj as usize));
        assert!(std::ptr::eq(unsafe { Mempool::from_obj(obj) }, mp));
    });
    assert_eq!(visited, 128);

    let chunks = mp.mem_iter(|_, addr, len, _| {
        assert!(!addr.is_null());
        assert!(len > 0);
    });
    assert!(chunks >= 1);

    // The backend choice is frozen once populated.
    assert!(matches!(
        mp.set_ops_by_name("ring_mp_mc"),
        Err(PoolError::AlreadyExists(_))
    ));

    Mempool::free(mp).unwrap();
}

#[test]
fn backend_selection_validation() {
    setup();
    let mp = Mempool::create_empty(
        "opsval",
        64,
        64,
        0,
        0,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();
    assert!(matches!(
        mp.set_ops_by_name("no_such_backend"),
        Err(PoolError::InvalidArgument(_))
    ));
    mp.set_ops_by_name("ring_mp_sc").unwrap();
    mp.populate_default().unwrap();
    Mempool::free(mp).unwrap();
}

#[test]
fn creation_validation() {
    setup();
    // Cache above the compile-time cap.
    assert!(matches!(
        Mempool::create_empty(
            "bad_cache",
            4096,
            64,
            CACHE_MAX_SIZE + 1,
            0,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty()
        ),
        Err(PoolError::InvalidArgument(_))
    ));
    // Cache above n / 1.5.
    assert!(matches!(
        Mempool::create_empty(
            "bad_cache2",
            32,
            64,
            32,
            0,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty()
        ),
        Err(PoolError::InvalidArgument(_))
    ));
    // Empty pools are rejected.
    assert!(matches!(
        Mempool::create_empty(
            "bad_n",
            0,
            64,
            0,
            0,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty()
        ),
        Err(PoolError::InvalidArgument(_))
    ));
}

#[test]
fn duplicate_names_and_lookup() {
    setup();
    let mp = Mempool::create(
        "dup",
        64,
        64,
        0,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();
    assert!(matches!(
        Mempool::create(
            "dup",
            64,
            64,
            0,
            0,
            None,
            None,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty()
        ),
        Err(PoolError::AlreadyExists(_))
    ));

    let found = Mempool::lookup("dup").unwrap();
    assert!(std::ptr::eq(found, mp));
    assert!(matches!(
        Mempool::lookup("missing"),
        Err(PoolError::NotFound(_))
    ));

    let mut names = Vec::new();
    Mempool::walk(|p| names.push(p.name().to_owned())).unwrap();
    assert!(names.contains(&"dup".to_owned()));

    Mempool::free(mp).unwrap();
}

#[test]
fn constructors_and_private_data() {
    setup();
    let mp = Mempool::create(
        "ctor",
        32,
        64,
        0,
        128,
        Some(&|mp: &Mempool| {
            // Pool constructor runs before population; stamp the private
            // area.
            unsafe { mp.private_data().cast::<u64>().write(0x5eed) };
        }),
        Some(&|_mp: &Mempool, obj: *mut u8, idx: u32| {
            unsafe { obj.cast::<u32>().write(idx ^ 0xabcd) };
        }),
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::empty(),
    )
    .unwrap();

    assert_eq!(unsafe { mp.private_data().cast::<u64>().read() }, 0x5eed);

    let mut stamps = std::collections::HashSet::new();
    mp.obj_iter(|_, obj, _| {
        stamps.insert(unsafe { obj.cast::<u32>().read() });
    });
    assert_eq!(stamps.len(), 32);
    for idx in 0..32u32 {
        assert!(stamps.contains(&(idx ^ 0xabcd)));
    }

    Mempool::free(mp).unwrap();
}

#[test]
fn sp_sc_exchange_between_threads() {
    setup();
    // Single producer thread, single consumer thread, SP/SC pool and an
    // SP/SC exchange ring: the in-process shape of the primary/secondary
    // exchange scenario.
    const COUNT: usize = 4096;
    let mp = Mempool::create(
        "xchg",
        64,
        128,
        0,
        0,
        None,
        None,
        shmem_rt::SOCKET_ID_ANY,
        PoolFlags::SP_PUT | PoolFlags::SC_GET,
    )
    .unwrap();
    let ring = Ring::create(
        "xchg",
        256,
        shmem_rt::SOCKET_ID_ANY,
        RingFlags::SP_ENQ | RingFlags::SC_DEQ,
    )
    .unwrap();

    std::thread::scope(|s| {
        s.spawn(move || {
            let mut sent = 0;
            while sent < COUNT {
                let Ok(obj) = mp.get() else {
                    std::hint::spin_loop();
                    continue;
                };
                unsafe { obj.cast::<u64>().write(sent as u64) };
                while ring.enqueue(obj).is_err() {
                    std::hint::spin_loop();
                }
                sent += 1;
            }
        });

        let mut received = 0;
        let mut expected = 0u64;
        while received < COUNT {
            let Ok(obj) = ring.dequeue() else {
                std::hint::spin_loop();
                continue;
            };
            // SP/SC ring preserves the send order.
            assert_eq!(unsafe { obj.cast::<u64>().read() }, expected);
            expected += 1;
            mp.put(obj);
            received += 1;
        }
    });

    assert_eq!(mp.avail_count(), mp.size());
    assert!(mp.is_full());

    Ring::free(ring).unwrap();
    Mempool::free(mp).unwrap();
}

#[cfg(debug_assertions)]
mod integrity {
    use super::*;

    #[test]
    fn double_put_panics() {
        setup();
        let mp = Mempool::create(
            "dblfree",
            32,
            64,
            0,
            0,
            None,
            None,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty(),
        )
        .unwrap();
        let obj = mp.get().unwrap();
        mp.put(obj);
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            mp.put(obj);
        }))
        .unwrap_err();
        let msg = err.downcast_ref::<String>().cloned().unwrap_or_default();
        assert!(msg.contains("double free"), "unexpected panic: {msg}");
    }

    #[test]
    fn foreign_pool_put_panics() {
        setup();
        let a = Mempool::create(
            "owner_a",
            32,
            64,
            0,
            0,
            None,
            None,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty(),
        )
        .unwrap();
        let b = Mempool::create(
            "owner_b",
            32,
            64,
            0,
            0,
            None,
            None,
            shmem_rt::SOCKET_ID_ANY,
            PoolFlags::empty(),
        )
        .unwrap();
        let obj = a.get().unwrap();
        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            b.put(obj);
        }))
        .unwrap_err();
        let msg = err.downcast_ref::<String>().cloned().unwrap_or_default();
        assert!(msg.contains("foreign pool"), "unexpected panic: {msg}");
        a.put(obj);
    }
}
