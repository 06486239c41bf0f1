//! Bootstrap tests: single-process primary startup against an anonymous
//! memory layout, plus the parts of the secondary protocol that can be
//! observed from one process (config file magic and anchor).

use shmem_rt::{lcore, thread, InternalConfig, ProcType, RtError, SharedConfig};
use std::path::PathBuf;
use std::sync::{Once, OnceLock};

fn runtime_dir() -> PathBuf {
    static DIR: OnceLock<PathBuf> = OnceLock::new();
    DIR.get_or_init(|| tempfile::tempdir().unwrap().into_path())
        .clone()
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let mut cfg = InternalConfig::default();
        cfg.no_hugetlbfs = true;
        cfg.memory = 64 * 1024 * 1024;
        cfg.file_prefix = format!("rt_{}", std::process::id());
        cfg.runtime_dir = Some(runtime_dir());
        shmem_rt::init_with(cfg).unwrap();
    });
}

#[test]
fn primary_comes_up() {
    setup();
    assert_eq!(shmem_rt::process_type().unwrap(), ProcType::Primary);

    let mem = shmem_rt::mem_config().unwrap();
    assert!(mem.is_complete());
    assert_eq!(mem.memseg_count(), 1);
    let seg = mem.memsegs()[0];
    assert_eq!(seg.len, 64 * 1024 * 1024);
    assert_eq!(seg.socket_id, 0);
    assert_ne!(seg.addr, 0);
}

#[test]
fn topology_is_populated() {
    setup();
    let count = lcore::count().unwrap();
    assert!(count > 0);

    let master = shmem_rt::master_lcore().unwrap();
    assert!(lcore::is_enabled(master));
    assert!(lcore::index(master).unwrap() >= 0);

    // Enabled lcores carry a dense index in id order.
    let mut prev = -1;
    for id in lcore::iter().unwrap() {
        let idx = lcore::index(id).unwrap();
        assert!(idx > prev);
        prev = idx;
    }
    assert_eq!(prev as usize + 1, count);
}

#[test]
fn master_thread_is_registered() {
    setup();
    // init_thread ran on the thread that called init_with; from this (test)
    // thread we may or may not be the master, but the queries must answer.
    let master = shmem_rt::master_lcore().unwrap();
    let socket = lcore::to_socket_id(master).unwrap();
    assert!((socket as usize) < shmem_rt::MAX_NUMA_NODES);
    // Unregistered test threads see the ANY markers.
    std::thread::spawn(|| {
        assert_eq!(thread::lcore_id(), shmem_rt::LCORE_ID_ANY);
        assert_eq!(thread::socket_id(), shmem_rt::SOCKET_ID_ANY);
    })
    .join()
    .unwrap();
}

#[test]
fn second_init_is_rejected() {
    setup();
    let mut cfg = InternalConfig::default();
    cfg.no_hugetlbfs = true;
    assert_eq!(
        shmem_rt::init_with(cfg).unwrap_err(),
        RtError::AlreadyInitialized
    );
}

#[test]
fn config_file_holds_magic_and_anchor() {
    setup();
    // Phase one of a secondary attach: map the control file read-only at an
    // arbitrary address and observe the published magic plus the anchor.
    let path = shmem_rt::internal_config().unwrap().runtime_config_path();
    let cpath = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
    let size = std::mem::size_of::<SharedConfig>();

    unsafe {
        let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY);
        assert!(fd >= 0, "config file missing at {}", path.display());
        let addr = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        );
        assert_ne!(addr, libc::MAP_FAILED);

        let shared = addr.cast::<SharedConfig>();
        shmem_rt::wait_layout_complete(&(*shared).mem).unwrap();
        let anchor = (*shared).mem.anchor();
        let local = shmem_rt::mem_config().unwrap() as *const _ as usize;
        assert_eq!(anchor, local);

        libc::munmap(addr, size);
        libc::close(fd);
    }
}
