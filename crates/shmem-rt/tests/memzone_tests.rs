//! Memzone registry tests: alignment and boundary constraints, name
//! collisions, free/reuse, largest-block reservations.

use shmem_rt::{memzone, InternalConfig, MemZone, MemzoneFlags, CACHE_LINE_SIZE};
use std::sync::{Mutex, MutexGuard, Once, OnceLock};

/// Serializes the tests of this binary: several assert on global allocator
/// state (directory count, largest free block, placement stability).
fn setup() -> MutexGuard<'static, ()> {
    static ONCE: Once = Once::new();
    static LOCK: Mutex<()> = Mutex::new(());
    ONCE.call_once(|| {
        static DIR: OnceLock<std::path::PathBuf> = OnceLock::new();
        let dir = DIR
            .get_or_init(|| tempfile::tempdir().unwrap().into_path())
            .clone();
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 64 * 1024 * 1024;
        cfg.file_prefix = format!("mz_{}", std::process::id());
        cfg.runtime_dir = Some(dir);
        shmem_rt::init_with(cfg).unwrap();
    });
    LOCK.lock().unwrap()
}

fn overlaps(a: &MemZone, b: &MemZone) -> bool {
    a.addr < b.addr + b.len && b.addr < a.addr + a.len
}

#[test]
fn alignment_grid() {
    let _guard = setup();
    let mut zones = Vec::new();
    for &align in &[32usize, 128, 256, 512, 1024] {
        let mz = memzone::reserve_aligned(
            &format!("align_{align}"),
            100,
            shmem_rt::SOCKET_ID_ANY,
            MemzoneFlags::empty(),
            align,
        )
        .unwrap();
        // Sub-cache-line requests are raised to the cache line.
        let effective = align.max(CACHE_LINE_SIZE);
        assert_eq!(mz.addr % effective, 0, "zone misaligned for align {align}");
        assert_ne!(mz.len, 0);
        assert_eq!(mz.len % CACHE_LINE_SIZE, 0);
        zones.push(mz);
    }

    for (i, a) in zones.iter().enumerate() {
        for b in &zones[i + 1..] {
            assert!(!overlaps(a, b), "zones {:?} and {:?} overlap", a.name(), b.name());
        }
    }
    for mz in zones {
        memzone::free(mz).unwrap();
    }
}

#[test]
fn boundary_window() {
    let _guard = setup();
    let mz = memzone::reserve_bounded(
        "bounded",
        100,
        shmem_rt::SOCKET_ID_ANY,
        MemzoneFlags::empty(),
        64,
        1024,
    )
    .unwrap();
    assert_eq!(mz.addr % 64, 0);
    // The whole span lies inside one 1024-aligned window.
    assert_eq!(mz.addr & !1023, (mz.addr + mz.len - 1) & !1023);
    memzone::free(mz).unwrap();
}

#[test]
fn invalid_constraints() {
    let _guard = setup();
    // Alignment must be a power of two.
    assert!(matches!(
        memzone::reserve_aligned("badalign", 64, shmem_rt::SOCKET_ID_ANY,
            MemzoneFlags::empty(), 48),
        Err(shmem_rt::RtError::InvalidArgument(_))
    ));
    // Boundary must be a power of two...
    assert!(matches!(
        memzone::reserve_bounded("badbound", 64, shmem_rt::SOCKET_ID_ANY,
            MemzoneFlags::empty(), 64, 1000),
        Err(shmem_rt::RtError::InvalidArgument(_))
    ));
    // ...and no smaller than the length.
    assert!(matches!(
        memzone::reserve_bounded("smallbound", 4096, shmem_rt::SOCKET_ID_ANY,
            MemzoneFlags::empty(), 64, 1024),
        Err(shmem_rt::RtError::InvalidArgument(_))
    ));
    // Names are capped below the directory slot size.
    let long = "x".repeat(shmem_rt::NAMESIZE);
    assert!(matches!(
        memzone::reserve(&long, 64, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty()),
        Err(shmem_rt::RtError::InvalidArgument(_))
    ));
}

#[test]
fn duplicate_name_rejected() {
    let _guard = setup();
    let mz = memzone::reserve("dupzone", 128, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty())
        .unwrap();
    assert!(matches!(
        memzone::reserve("dupzone", 128, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty()),
        Err(shmem_rt::RtError::AlreadyExists(_))
    ));
    memzone::free(mz).unwrap();
}

#[test]
fn lookup_returns_the_descriptor() {
    let _guard = setup();
    let mz = memzone::reserve("lk", 256, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty())
        .unwrap();
    let found = memzone::lookup("lk").unwrap();
    assert!(std::ptr::eq(mz, found));
    assert_eq!(found.name(), "lk");
    assert!(matches!(
        memzone::lookup("not_there"),
        Err(shmem_rt::RtError::NotFound(_))
    ));
    memzone::free(mz).unwrap();
    assert!(memzone::lookup("lk").is_err());
}

#[test]
fn free_and_re_reserve_is_stable() {
    let _guard = setup();
    let before = shmem_rt::mem_config().unwrap().memzone_count();

    let a = memzone::reserve_aligned("stable", 2000, shmem_rt::SOCKET_ID_ANY,
        MemzoneFlags::empty(), 256).unwrap();
    let addr = a.addr;
    memzone::free(a).unwrap();

    let b = memzone::reserve_aligned("stable", 2000, shmem_rt::SOCKET_ID_ANY,
        MemzoneFlags::empty(), 256).unwrap();
    assert_eq!(b.addr % 256, 0);
    // First-fit hands the same span back when nothing intervened.
    assert_eq!(b.addr, addr);
    memzone::free(b).unwrap();

    assert_eq!(shmem_rt::mem_config().unwrap().memzone_count(), before);
}

#[test]
fn freeing_a_foreign_descriptor_fails() {
    let _guard = setup();
    let fake: MemZone = unsafe { std::mem::zeroed() };
    assert!(matches!(
        memzone::free(&fake),
        Err(shmem_rt::RtError::InvalidArgument(_))
    ));
}

#[test]
fn len_zero_takes_the_largest_block() {
    let _guard = setup();
    let mz = memzone::reserve("biggest", 0, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty())
        .unwrap();
    assert!(mz.len > 0);
    assert_eq!(mz.len % CACHE_LINE_SIZE, 0);

    // Nothing bigger can be carved while it is held.
    assert!(matches!(
        memzone::reserve("toobig", mz.len + CACHE_LINE_SIZE, shmem_rt::SOCKET_ID_ANY,
            MemzoneFlags::empty()),
        Err(shmem_rt::RtError::NoMemory(_))
    ));
    memzone::free(mz).unwrap();
}

#[test]
fn oversized_request_is_rejected() {
    let _guard = setup();
    assert!(matches!(
        memzone::reserve("huge", 1 << 40, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty()),
        Err(shmem_rt::RtError::NoMemory(_))
    ));
}

#[test]
fn page_size_requests_honor_hint_only() {
    let _guard = setup();
    // The anonymous-memory instance has no 1 GiB pages: a strict request
    // fails, the hinted one falls back.
    assert!(matches!(
        memzone::reserve("strict_pg", 4096, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::PAGE_1GB),
        Err(shmem_rt::RtError::NoMemory(_))
    ));
    let mz = memzone::reserve(
        "hinted_pg",
        4096,
        shmem_rt::SOCKET_ID_ANY,
        MemzoneFlags::PAGE_1GB | MemzoneFlags::SIZE_HINT_ONLY,
    )
    .unwrap();
    assert_eq!(mz.len, 4096);
    memzone::free(mz).unwrap();
}

#[test]
fn walk_sees_live_zones() {
    let _guard = setup();
    let mz = memzone::reserve("walked", 128, shmem_rt::SOCKET_ID_ANY, MemzoneFlags::empty())
        .unwrap();
    let mut names = Vec::new();
    memzone::walk(|z| names.push(z.name().to_owned())).unwrap();
    assert!(names.contains(&"walked".to_owned()));
    memzone::free(mz).unwrap();
}
