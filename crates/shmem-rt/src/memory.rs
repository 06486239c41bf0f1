//! Physical memory layout: huge-page-backed segments per NUMA node.
//!
//! The huge-page filesystem probe is a collaborator; this module consumes
//! its resolved [`HugepageInfo`](crate::config::HugepageInfo) list. Each
//! reserved segment is one virtually contiguous mapping of a single page
//! size, recorded in insertion order in the shared segment table. With
//! `--no-huge` a single anonymous `MAP_SHARED` segment stands in, which
//! keeps forked children working but cannot be attached by an unrelated
//! secondary.

use crate::config::{
    InternalConfig, MemSeg, SharedConfig, MAX_NUMA_NODES, MEMSIZE_IF_NO_HUGE_PAGE,
};
use crate::RtError;
use log::{debug, info, warn};
use std::ffi::c_void;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

fn page_size() -> u64 {
    // SAFETY: plain sysconf query.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

fn map_shared(hint: usize, len: usize, fd: libc::c_int, anonymous: bool) -> Result<usize, RtError> {
    let flags = if anonymous {
        libc::MAP_SHARED | libc::MAP_ANONYMOUS
    } else {
        libc::MAP_SHARED
    };
    // SAFETY: len > 0; fd is valid unless anonymous; hint may be 0.
    let addr = unsafe {
        libc::mmap(
            hint as *mut c_void,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            if anonymous { -1 } else { fd },
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                RtError::PermissionDenied(format!("mmap: {err}"))
            }
            _ => RtError::NoMemory(format!("mmap of {len} bytes failed: {err}")),
        });
    }
    Ok(addr as usize)
}

/// Path of the backing file for segment `seg_idx`. Secondaries re-derive
/// the same path from the shared table index.
fn segment_file(dir: &std::path::Path, prefix: &str, seg_idx: usize) -> PathBuf {
    dir.join(format!("{prefix}map_{seg_idx}"))
}

fn hugedir_for(internal: &InternalConfig, hugepage_sz: u64) -> Option<PathBuf> {
    if let Some(dir) = &internal.hugepage_dir {
        return Some(dir.clone());
    }
    internal
        .hugepage_info
        .iter()
        .find(|hp| hp.hugepage_sz == hugepage_sz)
        .map(|hp| hp.hugedir.clone())
}

/// Reserves the memory layout in the primary.
pub(crate) fn memory_init(
    internal: &InternalConfig,
    shared: &SharedConfig,
) -> Result<(), RtError> {
    let mut per_socket = internal.socket_mem;
    if !internal.force_sockets {
        per_socket = [0; MAX_NUMA_NODES];
        per_socket[0] = if internal.memory != 0 {
            internal.memory
        } else {
            MEMSIZE_IF_NO_HUGE_PAGE
        };
    }

    // Rolling address hint keeps segments packed above base_virtaddr.
    let mut hint = internal.base_virtaddr;

    if internal.no_hugetlbfs {
        let len = per_socket.iter().sum::<u64>() as usize;
        let addr = map_shared(hint, len, -1, true)?;
        shared.mem.push_memseg(MemSeg {
            addr,
            len,
            hugepage_sz: page_size(),
            socket_id: 0,
            nchannel: internal.force_nchannel,
            nrank: internal.force_nrank,
        })?;
        info!(
            target: "eal",
            "reserved {len} bytes of anonymous memory at {addr:#x}"
        );
        return Ok(());
    }

    if internal.hugepage_info.is_empty() {
        return Err(RtError::PermissionDenied(
            "no huge pages available; pass --no-huge or a hugepage inventory".into(),
        ));
    }

    // Pages consumed from the inventory so far, per size and socket.
    let mut used = vec![[0u32; MAX_NUMA_NODES]; internal.hugepage_info.len()];

    for (socket, &wanted) in per_socket.iter().enumerate() {
        let mut remaining = wanted;
        while remaining > 0 {
            // Largest page size that fits the remaining request and still
            // has unconsumed pages on this socket.
            let left = |i: usize, hp: &crate::config::HugepageInfo| {
                hp.num_pages[socket].saturating_sub(used[i][socket])
            };
            let pick = internal
                .hugepage_info
                .iter()
                .enumerate()
                .filter(|(i, hp)| left(*i, hp) > 0 && hp.hugepage_sz <= remaining)
                .max_by_key(|(_, hp)| hp.hugepage_sz)
                .or_else(|| {
                    internal
                        .hugepage_info
                        .iter()
                        .enumerate()
                        .filter(|(i, hp)| left(*i, hp) > 0)
                        .min_by_key(|(_, hp)| hp.hugepage_sz)
                });
            let Some((hp_idx, hp)) = pick else {
                return Err(RtError::NoMemory(format!(
                    "not enough huge pages on socket {socket} \
                     ({remaining} bytes missing)"
                )));
            };

            let pages = (remaining.div_ceil(hp.hugepage_sz))
                .min(u64::from(left(hp_idx, hp)))
                .max(1);
            used[hp_idx][socket] += pages as u32;
            let len = (pages * hp.hugepage_sz) as usize;

            let seg_idx = shared.mem.memseg_count();
            let dir = hugedir_for(internal, hp.hugepage_sz)
                .unwrap_or_else(|| hp.hugedir.clone());
            let path = segment_file(&dir, &internal.file_prefix, seg_idx);
            let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
                .map_err(|_| RtError::invalid("hugepage path contains NUL"))?;
            // SAFETY: plain open(2).
            let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
            if fd < 0 {
                return Err(RtError::PermissionDenied(format!(
                    "cannot create {}: {}",
                    path.display(),
                    io::Error::last_os_error()
                )));
            }
            // SAFETY: fd valid; hugetlbfs rounds to whole pages.
            if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(RtError::NoMemory(format!(
                    "cannot grow {} to {len} bytes: {err}",
                    path.display()
                )));
            }
            let addr = match map_shared(hint, len, fd, false) {
                Ok(a) => a,
                Err(e) => {
                    // SAFETY: fd valid.
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            };
            // SAFETY: the mapping keeps the file alive; fd is not needed.
            unsafe { libc::close(fd) };
            if internal.hugepage_unlink {
                // SAFETY: unlink(2) on the path we just created.
                unsafe { libc::unlink(cpath.as_ptr()) };
            }

            shared.mem.push_memseg(MemSeg {
                addr,
                len,
                hugepage_sz: hp.hugepage_sz,
                socket_id: socket as i32,
                nchannel: internal.force_nchannel,
                nrank: internal.force_nrank,
            })?;
            debug!(
                target: "eal",
                "segment {seg_idx}: {len} bytes at {addr:#x} \
                 ({} byte pages, socket {socket})",
                hp.hugepage_sz
            );

            hint = addr + len;
            remaining = remaining.saturating_sub(len as u64);
        }
    }
    Ok(())
}

/// Maps the recorded segments in a secondary, at their recorded addresses.
pub(crate) fn memory_attach(
    internal: &InternalConfig,
    shared: &SharedConfig,
) -> Result<(), RtError> {
    let native_page = page_size();
    for (seg_idx, seg) in shared.mem.memsegs().iter().enumerate() {
        if seg.hugepage_sz == native_page {
            return Err(RtError::Unsupported);
        }
        let dir = hugedir_for(internal, seg.hugepage_sz).ok_or_else(|| {
            RtError::invalid(format!(
                "no hugepage directory known for {} byte pages",
                seg.hugepage_sz
            ))
        })?;
        let path = segment_file(&dir, &internal.file_prefix, seg_idx);
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| RtError::invalid("hugepage path contains NUL"))?;
        // SAFETY: plain open(2).
        let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            return Err(RtError::fatal(format!(
                "cannot open segment file {}: {}",
                path.display(),
                io::Error::last_os_error()
            )));
        }
        let addr = map_shared(seg.addr, seg.len, fd, false);
        // SAFETY: fd valid; mapping (if any) keeps the file alive.
        unsafe { libc::close(fd) };
        let addr = addr?;
        if addr != seg.addr {
            // SAFETY: addr was returned by mmap just above.
            unsafe { libc::munmap(addr as *mut c_void, seg.len) };
            return Err(RtError::fatal(format!(
                "segment {seg_idx} wanted at {:#x}, got {addr:#x}; \
                 try a --base-virtaddr override",
                seg.addr
            )));
        }
    }
    Ok(())
}

/// Warns when the master lcore's socket holds no memory.
pub(crate) fn check_socket_mem(shared: &SharedConfig) {
    let master = shared.cpu.master_lcore();
    let socket = shared.cpu.lcore(master).socket_id as i32;
    let has_local = shared
        .mem
        .memsegs()
        .iter()
        .any(|seg| seg.socket_id == socket && seg.len > 0);
    if !has_local {
        warn!(target: "eal", "master lcore has no memory on its local socket");
    }
}
