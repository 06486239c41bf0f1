//! Shared control region lifecycle: create (primary), attach (secondary),
//! and role arbitration.
//!
//! Role arbitration uses a non-blocking `fcntl` write lock over the segment
//! table's byte range. The lock lives as long as the file descriptor, which
//! is kept open for the process lifetime, so the kernel releases it on exit
//! or crash without any cleanup protocol.
//!
//! Secondaries attach in two phases: map read-only anywhere to learn the
//! anchor address the primary recorded, then re-map read-write at exactly
//! that address so every pointer stored inside the region stays valid.

use crate::config::{InternalConfig, ProcType, SharedConfig, CFG_VERSION};
use crate::RtError;
use crossbeam_utils::Backoff;
use log::{debug, error, info};
use std::ffi::c_void;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;
use std::time::{Duration, Instant};

/// How long a secondary waits for the primary to publish the magic.
const MAGIC_WAIT: Duration = Duration::from_secs(5);

/// The mapped control region plus the descriptor holding the role lock.
pub(crate) struct ConfigRegion {
    pub shared: ptr::NonNull<SharedConfig>,
    /// Kept open in the primary for the lifetime of the process; -1 once
    /// handed off or closed.
    pub fd: RawFd,
}

fn last_errno() -> io::Error {
    io::Error::last_os_error()
}

fn open_config(path: &Path, create: bool) -> Result<RawFd, RtError> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RtError::invalid("runtime config path contains NUL"))?;
    let flags = if create {
        libc::O_RDWR | libc::O_CREAT
    } else {
        libc::O_RDWR
    };
    // SAFETY: plain open(2) on a NUL-terminated path.
    let fd = unsafe { libc::open(cpath.as_ptr(), flags, 0o666) };
    if fd < 0 {
        let err = last_errno();
        return Err(match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                RtError::PermissionDenied(format!("cannot open {}: {err}", path.display()))
            }
            Some(libc::ENOENT) => {
                RtError::RoleConflict(format!("no runtime config at {}", path.display()))
            }
            _ => RtError::fatal(format!("cannot open {}: {err}", path.display())),
        });
    }
    if create {
        // The umask may have narrowed the mode; secondaries of other users
        // must still be able to open the file read-write.
        // SAFETY: fd is valid.
        unsafe { libc::fchmod(fd, 0o666) };
    }
    Ok(fd)
}

/// Attempts the non-blocking write lock that marks the primary.
fn try_write_lock(fd: RawFd) -> Result<bool, RtError> {
    let (start, len) = SharedConfig::memseg_lock_range();
    // SAFETY: zeroed flock is a valid base; we fill the fields we use.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start;
    fl.l_len = len;
    // SAFETY: fd is a valid open descriptor.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if rc == 0 {
        return Ok(true);
    }
    match last_errno().raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(RtError::fatal(format!(
            "fcntl lock on runtime config failed: {}",
            last_errno()
        ))),
    }
}

/// Detects the process role by probing the write lock, per the AUTO policy.
///
/// Returns the role and, when the file could be opened, the descriptor (the
/// caller keeps it so the lock outcome stays stable).
pub(crate) fn detect_proc_type(internal: &InternalConfig) -> (ProcType, RawFd) {
    let path = internal.runtime_config_path();
    let Ok(fd) = open_config(&path, false) else {
        // No config file yet: first process in, so primary.
        return (ProcType::Primary, -1);
    };
    match try_write_lock(fd) {
        Ok(true) => (ProcType::Primary, fd),
        Ok(false) => (ProcType::Secondary, fd),
        Err(_) => {
            // SAFETY: fd came from open above.
            unsafe { libc::close(fd) };
            (ProcType::Primary, -1)
        }
    }
}

/// Creates the shared control region (primary path).
pub(crate) fn create(internal: &InternalConfig, fd_hint: RawFd) -> Result<ConfigRegion, RtError> {
    let path = internal.runtime_config_path();
    let size = std::mem::size_of::<SharedConfig>();

    let fd = if fd_hint >= 0 {
        fd_hint
    } else {
        open_config(&path, true)?
    };

    // SAFETY: fd is valid; truncation zero-fills any extension.
    if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
        let err = last_errno();
        unsafe { libc::close(fd) };
        return Err(RtError::fatal(format!(
            "cannot resize {}: {err}",
            path.display()
        )));
    }

    if !try_write_lock(fd)? {
        unsafe { libc::close(fd) };
        return Err(RtError::RoleConflict(format!(
            "cannot lock {}; is another primary running?",
            path.display()
        )));
    }

    // Map just below the huge-page base address when one was requested, so
    // the control block does not burn a huge page out of that space.
    let hint = if internal.base_virtaddr != 0 {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        (internal.base_virtaddr.saturating_sub(size)) & !(page - 1)
    } else {
        0
    };

    // SAFETY: fd is valid and sized; hint may be NULL.
    let addr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = last_errno();
        unsafe { libc::close(fd) };
        return Err(RtError::fatal(format!(
            "cannot mmap runtime config: {err}"
        )));
    }

    // The file may be left over from a dead primary; reset it wholesale.
    // A zeroed image is the valid empty state of the layout.
    // SAFETY: addr spans `size` writable bytes.
    unsafe {
        ptr::write_bytes(addr.cast::<u8>(), 0, size);
        let shared = addr.cast::<SharedConfig>();
        (*shared).mem.set_version();
        (*shared).mem.nchannel = internal.force_nchannel;
        (*shared).mem.nrank = internal.force_nrank;
    }

    debug!(target: "eal", "runtime config mapped at {addr:p} ({size} bytes)");
    Ok(ConfigRegion {
        shared: ptr::NonNull::new(addr.cast::<SharedConfig>()).unwrap(),
        fd,
    })
}

/// Attaches to an existing region (secondary path): waits for the magic,
/// then re-maps at the primary's anchor address.
pub(crate) fn attach(internal: &InternalConfig, fd_hint: RawFd) -> Result<ConfigRegion, RtError> {
    let path = internal.runtime_config_path();
    let size = std::mem::size_of::<SharedConfig>();

    let fd = if fd_hint >= 0 {
        fd_hint
    } else {
        open_config(&path, false)?
    };

    // Phase one: read-only map at any address, just to learn the anchor.
    // SAFETY: fd is a valid descriptor of at least `size` bytes once the
    // primary has truncated it; mapping short files only faults on access,
    // and we do not touch the mapping before the magic check below.
    let probe = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if probe == libc::MAP_FAILED {
        let err = last_errno();
        unsafe { libc::close(fd) };
        return Err(RtError::fatal(format!(
            "cannot mmap runtime config: {err}"
        )));
    }

    let shared = probe.cast::<SharedConfig>();
    // SAFETY: the mapping is valid for reads; magic/anchor are atomics.
    let anchor = unsafe {
        match wait_complete(&(*shared).mem) {
            Ok(()) => (*shared).mem.anchor(),
            Err(e) => {
                libc::munmap(probe, size);
                libc::close(fd);
                return Err(e);
            }
        }
    };
    // SAFETY: probe was returned by mmap above.
    unsafe { libc::munmap(probe, size) };

    // Phase two: re-map read-write at the anchor.
    // SAFETY: anchor is a plain address hint; fd stays valid.
    let addr = unsafe {
        libc::mmap(
            anchor as *mut c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = last_errno();
        unsafe { libc::close(fd) };
        return Err(RtError::fatal(format!(
            "cannot re-mmap runtime config: {err}"
        )));
    }
    if addr as usize != anchor {
        unsafe {
            libc::munmap(addr, size);
            libc::close(fd);
        }
        error!(
            target: "eal",
            "runtime config wanted at {anchor:#x}, got {:#x}", addr as usize
        );
        return Err(RtError::fatal(format!(
            "cannot map runtime config at {anchor:#x}; \
             try a --base-virtaddr override"
        )));
    }

    let shared = addr.cast::<SharedConfig>();
    // SAFETY: mapping re-established read-write at the anchor.
    unsafe {
        if (*shared).mem.version() != CFG_VERSION {
            libc::munmap(addr, size);
            libc::close(fd);
            return Err(RtError::fatal("runtime config version mismatch"));
        }
    }

    info!(target: "eal", "attached to runtime config at {addr:p}");
    Ok(ConfigRegion {
        shared: ptr::NonNull::new(shared).unwrap(),
        fd,
    })
}

/// Spins (bounded, with backoff) until the primary publishes the magic.
pub(crate) fn wait_complete(mem: &crate::config::MemConfig) -> Result<(), RtError> {
    let start = Instant::now();
    let backoff = Backoff::new();
    while !mem.is_complete() {
        if start.elapsed() > MAGIC_WAIT {
            return Err(RtError::RoleConflict(
                "timed out waiting for a primary to complete initialization".into(),
            ));
        }
        if backoff.is_completed() {
            std::thread::sleep(Duration::from_millis(1));
        } else {
            backoff.snooze();
        }
    }
    Ok(())
}
