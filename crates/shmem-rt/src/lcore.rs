//! Logical-core topology probe and lcore queries.
//!
//! The probe walks the host CPU inventory once, in the primary, and fills
//! the shared lcore table: detected state, hardware core id, NUMA node and
//! the dense `core_index` numbering of enabled runtime cores. Detected
//! lcores are intersected with the calling thread's affinity mask to form
//! the default enabled set.

use crate::config::{CpuConfig, InternalConfig, LcoreRole, MAX_LCORE, MAX_NUMA_NODES};
use crate::RtError;
use log::{debug, info};
use std::path::{Path, PathBuf};

const SYS_CPU_DIR: &str = "/sys/devices/system/cpu";
const SYS_NODE_DIR: &str = "/sys/devices/system/node";

/// Parses a sysfs file containing one integer value.
fn parse_sysfs_value(path: &Path) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

fn cpu_path(lcore_id: u32, leaf: &str) -> PathBuf {
    PathBuf::from(format!("{SYS_CPU_DIR}/cpu{lcore_id}/{leaf}"))
}

/// Whether the logical CPU exists on this host.
fn cpu_detected(lcore_id: u32) -> bool {
    if Path::new(&format!("{SYS_CPU_DIR}/cpu{lcore_id}")).exists() {
        return true;
    }
    // Containers occasionally hide sysfs; fall back to the configured
    // processor count.
    if !Path::new(SYS_CPU_DIR).exists() {
        // SAFETY: plain sysconf query.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        return n > 0 && u64::from(lcore_id) < n as u64;
    }
    false
}

/// Hardware core id of the logical CPU within its socket.
fn cpu_core_id(lcore_id: u32) -> u32 {
    parse_sysfs_value(&cpu_path(lcore_id, "topology/core_id"))
        .map_or(lcore_id, |v| v as u32)
}

/// NUMA node of the logical CPU, resolved through the node directories.
fn cpu_socket_id(lcore_id: u32) -> u32 {
    for node in 0..MAX_NUMA_NODES as u32 {
        let path = format!("{SYS_NODE_DIR}/node{node}/cpu{lcore_id}");
        if Path::new(&path).exists() {
            return node;
        }
    }
    parse_sysfs_value(&cpu_path(lcore_id, "topology/physical_package_id"))
        .map_or(0, |v| v as u32)
}

/// Affinity mask of the calling thread.
pub(crate) fn thread_affinity() -> libc::cpu_set_t {
    // SAFETY: zeroed cpu_set_t is an empty set; sched_getaffinity fills it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            // Treat failure as "everything allowed".
            for i in 0..MAX_LCORE {
                libc::CPU_SET(i, &mut set);
            }
        }
        set
    }
}

/// Probes the host CPU inventory into the shared lcore table.
///
/// Runs once, in the primary, before the layout is published.
pub(crate) fn cpu_init(cpu: &CpuConfig, internal: &InternalConfig) -> Result<(), RtError> {
    let affinity = thread_affinity();
    let mut count: u32 = 0;

    for lcore_id in 0..MAX_LCORE as u32 {
        let detected = cpu_detected(lcore_id);
        // SAFETY: init path in the primary; nothing else can observe the
        // table before the magic is published.
        let slot = unsafe { &mut *cpu.lcore_slot(lcore_id) };
        *slot = unsafe { std::mem::zeroed() };
        slot.detected = u8::from(detected);
        slot.core_index = -1;

        if !detected {
            slot.core_role = LcoreRole::Off as u8;
            continue;
        }

        let socket_id = cpu_socket_id(lcore_id);
        if socket_id as usize >= MAX_NUMA_NODES {
            if internal.allow_invalid_socket_id {
                slot.socket_id = 0;
            } else {
                return Err(RtError::invalid(format!(
                    "socket id {socket_id} of lcore {lcore_id} exceeds the \
                     configured maximum ({MAX_NUMA_NODES})"
                )));
            }
        } else {
            slot.socket_id = socket_id;
        }
        slot.core_id = cpu_core_id(lcore_id);

        // 1:1 mapping between lcore id and cpu id.
        // SAFETY: lcore_id < CPU_SETSIZE by the MAX_LCORE bound.
        unsafe { libc::CPU_SET(lcore_id as usize, &mut slot.cpuset) };

        // Enabled by default only when the launching thread may run there.
        // SAFETY: same bound as above.
        if unsafe { libc::CPU_ISSET(lcore_id as usize, &affinity) } {
            slot.core_role = LcoreRole::Runtime as u8;
            slot.core_index = count as i32;
            count += 1;
        } else {
            slot.core_role = LcoreRole::Off as u8;
        }

        debug!(
            target: "eal",
            "detected lcore {lcore_id} as core {} on socket {}",
            slot.core_id, slot.socket_id
        );
    }

    if count == 0 {
        return Err(RtError::invalid(
            "no logical core intersects the launch affinity mask",
        ));
    }
    cpu.set_lcore_count(count);
    info!(target: "eal", "detected {count} usable lcore(s)");
    Ok(())
}

// ---------------------------------------------------------------------
// Public queries (valid after init/attach)
// ---------------------------------------------------------------------

/// Number of enabled runtime lcores.
pub fn count() -> Result<usize, RtError> {
    Ok(crate::cpu_config()?.lcore_count())
}

/// NUMA node of an lcore.
pub fn to_socket_id(lcore_id: u32) -> Result<u32, RtError> {
    if lcore_id as usize >= MAX_LCORE {
        return Err(RtError::invalid(format!("lcore {lcore_id} out of range")));
    }
    Ok(crate::cpu_config()?.lcore(lcore_id).socket_id)
}

/// Whether an lcore is an enabled runtime core.
pub fn is_enabled(lcore_id: u32) -> bool {
    if lcore_id as usize >= MAX_LCORE {
        return false;
    }
    crate::cpu_config()
        .map(|cpu| cpu.role(lcore_id) == LcoreRole::Runtime)
        .unwrap_or(false)
}

/// Dense index of an lcore among enabled ones, -1 when excluded.
pub fn index(lcore_id: u32) -> Result<i32, RtError> {
    if lcore_id as usize >= MAX_LCORE {
        return Err(RtError::invalid(format!("lcore {lcore_id} out of range")));
    }
    Ok(crate::cpu_config()?.lcore(lcore_id).core_index)
}

/// Iterator over enabled runtime lcores, in id order.
pub struct LcoreIter {
    cpu: &'static CpuConfig,
    next: u32,
    skip_master: bool,
    master: u32,
}

impl Iterator for LcoreIter {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        while (self.next as usize) < MAX_LCORE {
            let id = self.next;
            self.next += 1;
            if self.cpu.role(id) == LcoreRole::Runtime && !(self.skip_master && id == self.master)
            {
                return Some(id);
            }
        }
        None
    }
}

/// Iterates every enabled runtime lcore.
pub fn iter() -> Result<LcoreIter, RtError> {
    let cpu = crate::cpu_config()?;
    Ok(LcoreIter {
        cpu,
        next: 0,
        skip_master: false,
        master: 0,
    })
}

/// Iterates enabled runtime lcores, excluding the master.
pub fn iter_workers() -> Result<LcoreIter, RtError> {
    let cpu = crate::cpu_config()?;
    Ok(LcoreIter {
        cpu,
        next: 0,
        skip_master: true,
        master: cpu.master_lcore(),
    })
}

/// First enabled runtime lcore (the default master).
pub(crate) fn first_enabled(cpu: &CpuConfig) -> Option<u32> {
    (0..MAX_LCORE as u32).find(|&id| cpu.role(id) == LcoreRole::Runtime)
}
