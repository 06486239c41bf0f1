//! Runtime configuration: compile-time ceilings, the per-process internal
//! configuration filled by option parsing, and the repr(C) layout of the
//! shared control region.
//!
//! # Shared layout
//!
//! The control region is one file-backed mapping shared by every process of
//! an instance:
//!
//! ```text
//! +--------------------+  <- anchor address (identical in all processes)
//! | MemConfig          |  magic, version, anchor, segment table,
//! |                    |  memzone directory + its rwlock
//! +--------------------+  <- fixed offset (size_of::<MemConfig>())
//! | CpuConfig          |  lcore table, lcore count, master lcore
//! +--------------------+
//! ```
//!
//! The primary truncates the file (zero-filling it), writes its fields in
//! place and finally publishes `magic` with release ordering. A zeroed image
//! is a valid "empty" value for every field here: atomics at zero, unlocked
//! locks, free directory slots. Secondaries must observe `magic` (acquire)
//! before reading anything else.

use crate::sync::ShmRwLock;
use std::cell::UnsafeCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

// ---------------------------------------------------------------------
// Compile-time ceilings
// ---------------------------------------------------------------------

/// Maximum number of logical CPUs tracked by the runtime.
pub const MAX_LCORE: usize = 128;
/// Maximum number of NUMA nodes.
pub const MAX_NUMA_NODES: usize = 8;
/// Maximum number of memory segments in the shared table.
pub const MAX_MEMSEG: usize = 256;
/// Maximum number of entries in the memzone directory.
pub const MAX_MEMZONE: usize = 2560;
/// Maximum length of a shared object name, including the NUL-style cap
/// (usable characters: `NAMESIZE - 1`).
pub const NAMESIZE: usize = 32;
/// Cache line size assumed for alignment decisions.
pub const CACHE_LINE_SIZE: usize = 64;

/// Reserved lcore id meaning "not a runtime thread".
pub const LCORE_ID_ANY: u32 = u32::MAX;
/// Any NUMA socket is acceptable.
pub const SOCKET_ID_ANY: i32 = -1;

/// Value published in [`MemConfig::magic`] once the layout is complete.
pub const CFG_MAGIC: u32 = 0x534d_5254;
/// Version stamp of the shared layout.
pub const CFG_VERSION: u32 = 1;

/// Memory mapped when huge pages are disabled and no size was given.
pub const MEMSIZE_IF_NO_HUGE_PAGE: u64 = 64 * 1024 * 1024;

/// `--base-virtaddr` is aligned up to this (the largest minimum huge page
/// size among supported platforms).
pub const BASE_VIRTADDR_ALIGN: u64 = PGSIZE_16M;

pub const PGSIZE_4K: u64 = 1 << 12;
pub const PGSIZE_2M: u64 = 1 << 21;
pub const PGSIZE_16M: u64 = 1 << 24;
pub const PGSIZE_1G: u64 = 1 << 30;
pub const PGSIZE_16G: u64 = 1 << 34;

static_assertions::const_assert!(MAX_MEMZONE >= MAX_MEMSEG);
static_assertions::const_assert!(NAMESIZE.is_power_of_two());

// ---------------------------------------------------------------------
// Process role
// ---------------------------------------------------------------------

/// Multi-process role of the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcType {
    /// Resolve to primary if the control-file write lock can be taken,
    /// secondary otherwise.
    Auto,
    /// The single process that owns layout creation.
    Primary,
    /// A process attaching to an existing layout.
    Secondary,
}

/// Role of a logical core. Zero (the file's initial state) is `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LcoreRole {
    Off = 0,
    Runtime = 1,
    Service = 2,
}

impl LcoreRole {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Runtime,
            2 => Self::Service,
            _ => Self::Off,
        }
    }
}

// ---------------------------------------------------------------------
// Internal (per-process) configuration
// ---------------------------------------------------------------------

/// One huge-page size resolved by the filesystem probe collaborator.
#[derive(Debug, Clone)]
pub struct HugepageInfo {
    /// Size of one page in bytes.
    pub hugepage_sz: u64,
    /// Directory where the corresponding hugetlbfs is mounted.
    pub hugedir: PathBuf,
    /// Pages available per NUMA node.
    pub num_pages: [u32; MAX_NUMA_NODES],
}

/// Per-process knobs, filled by option parsing or the typed builder.
#[derive(Debug, Clone)]
pub struct InternalConfig {
    /// Total amount of requested memory in bytes (`-m`, in MB on the wire).
    pub memory: u64,
    /// Forced memory channel count (`-n`), 0 = unknown.
    pub force_nchannel: u32,
    /// Forced memory rank count (`-r`), 0 = unknown.
    pub force_nrank: u32,
    /// `--no-huge`: use anonymous memory instead of huge pages.
    pub no_hugetlbfs: bool,
    /// `--huge-unlink`: unlink backing files once mapped.
    pub hugepage_unlink: bool,
    /// `--proc-type`.
    pub process_type: ProcType,
    /// `--socket-mem` was given.
    pub force_sockets: bool,
    /// Per-socket memory request in bytes.
    pub socket_mem: [u64; MAX_NUMA_NODES],
    /// `--base-virtaddr`, 0 = unconstrained.
    pub base_virtaddr: usize,
    /// Numeric syslog facility handed to the sink collaborator.
    pub syslog_facility: i32,
    /// `--file-prefix`: base name of the runtime files.
    pub file_prefix: String,
    /// `--huge-dir` override.
    pub hugepage_dir: Option<PathBuf>,
    /// Runtime directory override (used by tests; defaults per-user).
    pub runtime_dir: Option<PathBuf>,
    /// `--master-lcore` override.
    pub master_lcore: Option<u32>,
    /// `--log-level` pattern/level pairs, applied globally and forwarded to
    /// the sink.
    pub log_levels: Vec<(Option<String>, log::LevelFilter)>,
    /// Resolved huge-page inventory (supplied by the probe collaborator).
    pub hugepage_info: Vec<HugepageInfo>,
    /// Force out-of-range NUMA ids to node 0 instead of failing the probe.
    pub allow_invalid_socket_id: bool,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            memory: 0,
            force_nchannel: 0,
            force_nrank: 0,
            no_hugetlbfs: false,
            hugepage_unlink: false,
            process_type: ProcType::Auto,
            force_sockets: false,
            socket_mem: [0; MAX_NUMA_NODES],
            base_virtaddr: 0,
            syslog_facility: libc::LOG_DAEMON,
            file_prefix: "shmem".to_owned(),
            hugepage_dir: None,
            runtime_dir: None,
            master_lcore: None,
            log_levels: Vec::new(),
            hugepage_info: Vec::new(),
            allow_invalid_socket_id: false,
        }
    }
}

impl InternalConfig {
    /// Full path of the runtime configuration file for this instance.
    pub fn runtime_config_path(&self) -> PathBuf {
        let dir = self.runtime_dir.clone().unwrap_or_else(default_runtime_dir);
        dir.join(format!(".{}_config", self.file_prefix))
    }
}

fn default_runtime_dir() -> PathBuf {
    // Root gets the system runtime dir; everyone else their own.
    if unsafe { libc::getuid() } == 0 {
        return PathBuf::from("/var/run");
    }
    if let Ok(dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home);
    }
    std::env::temp_dir()
}

// ---------------------------------------------------------------------
// Shared control region layout
// ---------------------------------------------------------------------

/// One virtually contiguous, single-page-size span on one NUMA node.
///
/// Written by the primary during init; read-only for everyone afterwards.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemSeg {
    /// Virtual base address (identical across processes).
    pub addr: usize,
    /// Length in bytes, a multiple of the page size.
    pub len: usize,
    /// Size of the backing pages.
    pub hugepage_sz: u64,
    /// NUMA node the pages live on.
    pub socket_id: i32,
    /// Memory channel hint (0 = unknown).
    pub nchannel: u32,
    /// Memory rank hint (0 = unknown).
    pub nrank: u32,
}

impl MemSeg {
    #[inline]
    pub fn end(&self) -> usize {
        self.addr + self.len
    }
}

/// A named, immutable sub-region of exactly one segment.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MemZone {
    name: [u8; NAMESIZE],
    /// Virtual base address.
    pub addr: usize,
    /// Length in bytes (rounded up to the cache line at reservation).
    pub len: usize,
    /// Page size inherited from the segment.
    pub hugepage_sz: u64,
    /// NUMA node inherited from the segment.
    pub socket_id: i32,
    /// Reservation flags as passed by the caller.
    pub flags: u32,
    /// Index of the owning segment in the segment table.
    pub seg_idx: u32,
}

impl MemZone {
    /// The zone name as UTF-8 (names are validated at reservation).
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAMESIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Base address as a raw pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.addr == 0
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = [0; NAMESIZE];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }

    #[inline]
    pub(crate) fn name_is(&self, name: &str) -> bool {
        !self.is_free() && self.name() == name
    }
}

/// Memory half of the shared control region.
#[repr(C)]
pub struct MemConfig {
    magic: AtomicU32,
    version: u32,
    /// Detected or forced memory channel count.
    pub nchannel: u32,
    /// Detected or forced memory rank count.
    pub nrank: u32,
    /// Address the primary mapped this region at, so secondaries can re-map
    /// to the identical range.
    anchor: AtomicUsize,
    /// Guards the memzone directory (writers exclusive, readers shared).
    pub mlock: ShmRwLock,
    memseg_cnt: AtomicU32,
    memzone_cnt: AtomicU32,
    memsegs: UnsafeCell<[MemSeg; MAX_MEMSEG]>,
    zones: [UnsafeCell<MemZone>; MAX_MEMZONE],
}

// SAFETY: zone slots are only mutated under `mlock` (write side); segments
// are written by the primary before `magic` is published. The UnsafeCell is
// there so directory slots can be recycled through a shared reference.
unsafe impl Sync for MemConfig {}

impl MemConfig {
    /// True once the primary has completed layout publication.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.magic.load(Ordering::Acquire) == CFG_MAGIC
    }

    /// Publishes the completed layout (primary only). Release-ordered so a
    /// secondary's acquire load of the magic sees every prior write.
    pub(crate) fn publish(&self) {
        self.anchor
            .store(self as *const Self as usize, Ordering::Relaxed);
        self.magic.store(CFG_MAGIC, Ordering::Release);
    }

    pub(crate) fn set_version(&mut self) {
        self.version = CFG_VERSION;
    }

    /// Address the primary mapped the region at.
    #[inline]
    pub fn anchor(&self) -> usize {
        self.anchor.load(Ordering::Relaxed)
    }

    pub(crate) fn version(&self) -> u32 {
        self.version
    }

    // --- segment table ------------------------------------------------

    pub fn memseg_count(&self) -> usize {
        self.memseg_cnt.load(Ordering::Relaxed) as usize
    }

    /// The ordered segment table (valid entries only).
    pub fn memsegs(&self) -> &[MemSeg] {
        let n = self.memseg_count();
        // SAFETY: segments are written only during primary init, before
        // the magic is published; the table is immutable afterwards.
        unsafe { &(&*self.memsegs.get())[..n] }
    }

    /// Appends a segment (primary init only, before publication).
    pub(crate) fn push_memseg(&self, seg: MemSeg) -> Result<usize, crate::RtError> {
        let idx = self.memseg_cnt.load(Ordering::Relaxed) as usize;
        if idx >= MAX_MEMSEG {
            return Err(crate::RtError::NoMemory("memseg table exhausted".into()));
        }
        // SAFETY: init path runs in the primary before the magic is
        // published; no other process can observe the table yet.
        unsafe {
            (*self.memsegs.get())[idx] = seg;
        }
        self.memseg_cnt.store(idx as u32 + 1, Ordering::Relaxed);
        Ok(idx)
    }

    // --- memzone directory --------------------------------------------

    pub fn memzone_count(&self) -> usize {
        self.memzone_cnt.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn bump_memzones(&self, delta: i32) {
        if delta >= 0 {
            self.memzone_cnt
                .fetch_add(delta as u32, Ordering::Relaxed);
        } else {
            self.memzone_cnt
                .fetch_sub((-delta) as u32, Ordering::Relaxed);
        }
    }

    /// Raw slot pointer. Callers must hold `mlock` appropriately.
    #[inline]
    pub(crate) fn zone_slot(&self, idx: usize) -> *mut MemZone {
        self.zones[idx].get()
    }
}

/// Per-lcore record inside [`CpuConfig`].
#[derive(Clone, Copy)]
#[repr(C)]
pub struct LcoreConfig {
    /// 1 when the logical CPU exists on this host.
    pub detected: u8,
    /// Raw [`LcoreRole`].
    pub core_role: u8,
    /// Hardware core id within the socket.
    pub core_id: u32,
    /// Dense index among enabled runtime lcores, -1 when excluded.
    pub core_index: i32,
    /// NUMA node of the lcore.
    pub socket_id: u32,
    /// Affinity set of the lcore's thread.
    pub cpuset: libc::cpu_set_t,
}

impl LcoreConfig {
    #[inline]
    pub fn role(&self) -> LcoreRole {
        LcoreRole::from_raw(self.core_role)
    }
}

/// CPU half of the shared control region; follows [`MemConfig`] at a fixed
/// offset so re-anchoring makes both regions' pointers valid everywhere.
#[repr(C)]
pub struct CpuConfig {
    lcore_count: AtomicU32,
    master_lcore: AtomicU32,
    lcores: [UnsafeCell<LcoreConfig>; MAX_LCORE],
}

// SAFETY: lcore slots are written by the primary during the probe (before
// publication) and afterwards only by the owning lcore's thread when it
// changes its own affinity.
unsafe impl Sync for CpuConfig {}

impl CpuConfig {
    /// Number of enabled runtime lcores.
    pub fn lcore_count(&self) -> usize {
        self.lcore_count.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_lcore_count(&self, n: u32) {
        self.lcore_count.store(n, Ordering::Relaxed);
    }

    /// The master lcore id.
    pub fn master_lcore(&self) -> u32 {
        self.master_lcore.load(Ordering::Relaxed)
    }

    pub(crate) fn set_master_lcore(&self, id: u32) {
        self.master_lcore.store(id, Ordering::Relaxed);
    }

    /// Reads the record of one lcore.
    pub fn lcore(&self, lcore_id: u32) -> LcoreConfig {
        assert!((lcore_id as usize) < MAX_LCORE);
        // SAFETY: records are plain data; concurrent writers are limited to
        // the owning thread (affinity mirror), and readers tolerate a torn
        // cpuset the same way the lock-free counters do.
        unsafe { *self.lcores[lcore_id as usize].get() }
    }

    #[inline]
    pub(crate) fn lcore_slot(&self, lcore_id: u32) -> *mut LcoreConfig {
        self.lcores[lcore_id as usize].get()
    }

    /// Role of one lcore.
    pub fn role(&self, lcore_id: u32) -> LcoreRole {
        self.lcore(lcore_id).role()
    }
}

/// The complete shared control region.
#[repr(C)]
pub struct SharedConfig {
    pub mem: MemConfig,
    pub cpu: CpuConfig,
}

impl SharedConfig {
    /// Byte range of the segment table inside the file; the primary's write
    /// lock covers exactly this range.
    pub(crate) fn memseg_lock_range() -> (i64, i64) {
        let start = std::mem::offset_of!(SharedConfig, mem)
            + std::mem::offset_of!(MemConfig, memsegs);
        let len = std::mem::size_of::<[MemSeg; MAX_MEMSEG]>();
        (start as i64, len as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_name_roundtrip() {
        let mut mz: MemZone = unsafe { std::mem::zeroed() };
        mz.set_name("RG_test");
        mz.addr = 0x1000;
        assert_eq!(mz.name(), "RG_test");
        assert!(mz.name_is("RG_test"));
        assert!(!mz.name_is("RG_other"));
    }

    #[test]
    fn runtime_path_uses_prefix() {
        let mut cfg = InternalConfig::default();
        cfg.file_prefix = "unit".into();
        cfg.runtime_dir = Some(PathBuf::from("/tmp"));
        assert_eq!(
            cfg.runtime_config_path(),
            PathBuf::from("/tmp/.unit_config")
        );
    }

    #[test]
    fn lock_range_covers_segment_table() {
        let (start, len) = SharedConfig::memseg_lock_range();
        assert!(start > 0);
        assert_eq!(len as usize, std::mem::size_of::<[MemSeg; MAX_MEMSEG]>());
    }

    #[test]
    fn zeroed_region_is_unpublished() {
        let cfg: Box<MemConfig> = unsafe { Box::new(std::mem::zeroed()) };
        assert!(!cfg.is_complete());
        assert_eq!(cfg.memseg_count(), 0);
        assert_eq!(cfg.memzone_count(), 0);
    }
}
