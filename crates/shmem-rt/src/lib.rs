//! Shared-memory runtime core.
//!
//! A *primary* process discovers the CPU topology, reserves huge-page-backed
//! memory segments and publishes everything through a file-backed control
//! region; *secondary* processes attach to the same layout at the same
//! virtual addresses. Named memory zones carved from the segments are the
//! allocation primitive everything above (rings, object pools) builds on.
//!
//! # Example
//!
//! ```no_run
//! use shmem_rt::{memzone, InternalConfig};
//!
//! let mut cfg = InternalConfig::default();
//! cfg.no_hugetlbfs = true;
//! shmem_rt::init_with(cfg).unwrap();
//!
//! let mz = memzone::reserve("app_state", 4096, shmem_rt::SOCKET_ID_ANY,
//!     memzone::MemzoneFlags::empty()).unwrap();
//! assert_eq!(mz.len, 4096);
//! ```

mod config;
mod error;
pub mod lcore;
mod memory;
pub mod memzone;
pub mod options;
mod shared;
mod sync;
pub mod thread;

pub use config::{
    CpuConfig, HugepageInfo, InternalConfig, LcoreConfig, LcoreRole, MemConfig, MemSeg, MemZone,
    ProcType, SharedConfig, CACHE_LINE_SIZE, LCORE_ID_ANY, MAX_LCORE, MAX_MEMSEG, MAX_MEMZONE,
    MAX_NUMA_NODES, NAMESIZE, PGSIZE_16G, PGSIZE_16M, PGSIZE_1G, PGSIZE_2M, PGSIZE_4K,
    SOCKET_ID_ANY,
};
pub use error::RtError;
pub use memzone::MemzoneFlags;
pub use sync::{ShmRwLock, ShmSpinLock};

use log::{error, info};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, Ordering};
use std::sync::Mutex;

static RUN_ONCE: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);
static SHARED: AtomicPtr<SharedConfig> = AtomicPtr::new(std::ptr::null_mut());
static CFG_FD: AtomicI32 = AtomicI32::new(-1);
static PROC_TYPE: AtomicU8 = AtomicU8::new(0);
static INTERNAL: Mutex<Option<InternalConfig>> = Mutex::new(None);

/// Crate version string.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(target_arch = "x86_64")]
fn cpu_is_supported() -> bool {
    std::arch::is_x86_feature_detected!("sse4.2")
}

#[cfg(not(target_arch = "x86_64"))]
fn cpu_is_supported() -> bool {
    true
}

/// The memory half of the shared control region.
pub fn mem_config() -> Result<&'static MemConfig, RtError> {
    let ptr = SHARED.load(Ordering::Acquire);
    if ptr.is_null() {
        return Err(RtError::NoConfig);
    }
    // SAFETY: the pointer is only published after a successful init/attach
    // and cleared before the mapping goes away in cleanup.
    Ok(unsafe { &(*ptr).mem })
}

/// The CPU half of the shared control region.
pub fn cpu_config() -> Result<&'static CpuConfig, RtError> {
    let ptr = SHARED.load(Ordering::Acquire);
    if ptr.is_null() {
        return Err(RtError::NoConfig);
    }
    // SAFETY: as in `mem_config`.
    Ok(unsafe { &(*ptr).cpu })
}

/// Role this process resolved to.
pub fn process_type() -> Result<ProcType, RtError> {
    match PROC_TYPE.load(Ordering::Acquire) {
        1 => Ok(ProcType::Primary),
        2 => Ok(ProcType::Secondary),
        _ => Err(RtError::NoConfig),
    }
}

/// The master lcore id.
pub fn master_lcore() -> Result<u32, RtError> {
    Ok(cpu_config()?.master_lcore())
}

/// Whether the instance runs on real huge pages.
pub fn has_hugepages() -> Result<bool, RtError> {
    let guard = INTERNAL.lock().unwrap();
    guard
        .as_ref()
        .map(|cfg| !cfg.no_hugetlbfs)
        .ok_or(RtError::NoConfig)
}

/// Copy of the internal configuration (inspection only).
pub fn internal_config() -> Result<InternalConfig, RtError> {
    let guard = INTERNAL.lock().unwrap();
    guard.clone().ok_or(RtError::NoConfig)
}

fn alert(msg: &str) {
    eprintln!("eal: fatal: {msg}");
    error!(target: "eal", "{msg}");
}

/// Primary-side startup from an argument vector (program name excluded).
///
/// Returns the number of consumed arguments. `-h` prints the usage text and
/// exits the process with status 0, matching the documented CLI contract;
/// malformed options print the usage text to stderr and return
/// [`RtError::InvalidArgument`].
pub fn init<I>(args: I) -> Result<usize, RtError>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut cfg = InternalConfig::default();
    let parsed = options::parse(&mut cfg, &args).map_err(|e| {
        eprintln!("{}", options::usage("shmem-rt"));
        e
    })?;
    if parsed.help {
        print!("{}", options::usage("shmem-rt"));
        std::process::exit(0);
    }
    if parsed.version {
        error!(target: "eal", "shmem-rt version {}", version());
    }
    init_with(cfg)?;
    Ok(parsed.consumed)
}

/// Secondary-side startup from an argument vector.
///
/// Identical to [`init`] except the role defaults to secondary; requesting
/// `--proc-type primary` here is a role conflict.
pub fn attach<I>(args: I) -> Result<usize, RtError>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    let mut cfg = InternalConfig::default();
    let parsed = options::parse(&mut cfg, &args).map_err(|e| {
        eprintln!("{}", options::usage("shmem-rt"));
        e
    })?;
    if parsed.help {
        print!("{}", options::usage("shmem-rt"));
        std::process::exit(0);
    }
    match cfg.process_type {
        ProcType::Primary => {
            return Err(RtError::RoleConflict(
                "attach() cannot run as a primary process".into(),
            ))
        }
        ProcType::Auto | ProcType::Secondary => cfg.process_type = ProcType::Secondary,
    }
    init_with(cfg)?;
    Ok(parsed.consumed)
}

/// Typed startup entry: the same bootstrap as [`init`]/[`attach`], driven by
/// an [`InternalConfig`] instead of an argument vector.
pub fn init_with(cfg: InternalConfig) -> Result<(), RtError> {
    if !cpu_is_supported() {
        alert("unsupported cpu type");
        return Err(RtError::Unsupported);
    }
    if RUN_ONCE.swap(true, Ordering::SeqCst) {
        alert("already called initialization");
        return Err(RtError::AlreadyInitialized);
    }
    match bootstrap(cfg) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Leave the process re-initializable after a failed bootstrap.
            RUN_ONCE.store(false, Ordering::SeqCst);
            alert(&e.to_string());
            Err(e)
        }
    }
}

fn bootstrap(cfg: InternalConfig) -> Result<(), RtError> {
    options::check(&cfg)?;
    options::apply_log_levels(&cfg);

    // Resolve AUTO through the control-file write lock.
    let (proc_type, fd_hint) = match cfg.process_type {
        ProcType::Auto => {
            let (t, fd) = shared::detect_proc_type(&cfg);
            info!(
                target: "eal",
                "auto-detected process type: {}",
                if t == ProcType::Primary { "primary" } else { "secondary" }
            );
            (t, fd)
        }
        ProcType::Primary => (ProcType::Primary, -1),
        ProcType::Secondary => (ProcType::Secondary, -1),
    };

    let region = match proc_type {
        ProcType::Primary => shared::create(&cfg, fd_hint)?,
        ProcType::Secondary => shared::attach(&cfg, fd_hint)?,
        ProcType::Auto => unreachable!(),
    };

    // SAFETY: the region mapping is live for the rest of the process.
    let shared_ref: &'static SharedConfig = unsafe { region.shared.as_ref() };
    SHARED.store(region.shared.as_ptr(), Ordering::Release);
    CFG_FD.store(region.fd, Ordering::Relaxed);
    PROC_TYPE.store(
        if proc_type == ProcType::Primary { 1 } else { 2 },
        Ordering::Release,
    );

    let result = match proc_type {
        ProcType::Primary => bootstrap_primary(&cfg, shared_ref),
        ProcType::Secondary => bootstrap_secondary(&cfg, shared_ref),
        ProcType::Auto => unreachable!(),
    };
    if let Err(e) = result {
        // Unwind the partially installed state.
        SHARED.store(std::ptr::null_mut(), Ordering::Release);
        PROC_TYPE.store(0, Ordering::Release);
        let fd = CFG_FD.swap(-1, Ordering::Relaxed);
        // SAFETY: region.shared came from mmap of this size; fd from open.
        unsafe {
            libc::munmap(
                region.shared.as_ptr().cast(),
                std::mem::size_of::<SharedConfig>(),
            );
            if fd >= 0 {
                libc::close(fd);
            }
        }
        return Err(e);
    }

    *INTERNAL.lock().unwrap() = Some(cfg);
    INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

fn resolve_master(cfg: &InternalConfig, cpu: &CpuConfig) -> Result<u32, RtError> {
    // Role lookups are only meaningful once the probe has filled the table,
    // so this runs strictly after it.
    let master = match cfg.master_lcore {
        Some(id) => id,
        None => lcore::first_enabled(cpu)
            .ok_or_else(|| RtError::invalid("no enabled runtime lcore"))?,
    };
    if (master as usize) >= MAX_LCORE || cpu.role(master) != LcoreRole::Runtime {
        return Err(RtError::invalid(format!(
            "master lcore {master} is not an enabled runtime core"
        )));
    }
    Ok(master)
}

fn bootstrap_primary(cfg: &InternalConfig, shared_ref: &'static SharedConfig) -> Result<(), RtError> {
    lcore::cpu_init(&shared_ref.cpu, cfg)?;
    let master = resolve_master(cfg, &shared_ref.cpu)?;
    shared_ref.cpu.set_master_lcore(master);

    memory::memory_init(cfg, shared_ref)?;

    // Layout complete: segments and topology are in place, the memzone
    // directory starts empty. Publish for secondaries.
    shared_ref.mem.publish();

    memory::check_socket_mem(shared_ref);
    thread::init_thread(master)?;
    info!(
        target: "eal",
        "primary up: master lcore {master}, {} segment(s)",
        shared_ref.mem.memseg_count()
    );
    Ok(())
}

fn bootstrap_secondary(
    cfg: &InternalConfig,
    shared_ref: &'static SharedConfig,
) -> Result<(), RtError> {
    memory::memory_attach(cfg, shared_ref)?;
    let master = match cfg.master_lcore {
        Some(id) => {
            if (id as usize) >= MAX_LCORE || shared_ref.cpu.role(id) != LcoreRole::Runtime {
                return Err(RtError::invalid(format!(
                    "master lcore {id} is not an enabled runtime core"
                )));
            }
            id
        }
        None => shared_ref.cpu.master_lcore(),
    };
    thread::init_thread(master)?;
    info!(target: "eal", "secondary attached: master lcore {master}");
    Ok(())
}

/// Releases core-owned resources. After this call no runtime API may be
/// invoked; a renewed `init` in the same process is also rejected.
pub fn cleanup() -> Result<(), RtError> {
    if !INITIALIZED.swap(false, Ordering::SeqCst) {
        return Err(RtError::NoConfig);
    }
    let ptr = SHARED.swap(std::ptr::null_mut(), Ordering::Release);
    PROC_TYPE.store(0, Ordering::Release);
    let fd = CFG_FD.swap(-1, Ordering::Relaxed);
    *INTERNAL.lock().unwrap() = None;
    // SAFETY: ptr/fd were installed by a successful bootstrap.
    unsafe {
        if !ptr.is_null() {
            libc::munmap(ptr.cast(), std::mem::size_of::<SharedConfig>());
        }
        if fd >= 0 {
            libc::close(fd);
        }
    }
    Ok(())
}

/// Blocks until the shared layout of `mem` is published. Exposed for
/// collaborators that map the control file themselves.
pub fn wait_layout_complete(mem: &MemConfig) -> Result<(), RtError> {
    shared::wait_complete(mem)
}
