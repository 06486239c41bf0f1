//! Named memory zones: alignment- and boundary-constrained reservations
//! carved out of the shared memory segments, discoverable by name from any
//! process of the instance.
//!
//! Allocation policy is first-fit across segments in insertion order. Free
//! spans are derived from the directory itself: the gaps between live zones
//! inside each segment. Freeing a zone removes its directory entry, so
//! adjacent free space coalesces by construction.

use crate::config::{
    MemZone, CACHE_LINE_SIZE, MAX_MEMZONE, NAMESIZE, PGSIZE_16G, PGSIZE_16M, PGSIZE_1G, PGSIZE_2M,
    SOCKET_ID_ANY,
};
use crate::RtError;
use bitflags::bitflags;
use log::debug;

bitflags! {
    /// Reservation flags: page-size requests plus hint-only semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemzoneFlags: u32 {
        /// Require the zone to live on 2 MiB pages.
        const PAGE_2MB = 0x0000_0001;
        /// Require the zone to live on 1 GiB pages.
        const PAGE_1GB = 0x0000_0002;
        /// Require the zone to live on 16 MiB pages.
        const PAGE_16MB = 0x0000_0100;
        /// Require the zone to live on 16 GiB pages.
        const PAGE_16GB = 0x0000_0200;
        /// Turn the page-size requirement into a preference: fall back to
        /// any available page size when the requested one is absent.
        const SIZE_HINT_ONLY = 0x0000_0004;
    }
}

#[inline]
pub(crate) fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

#[inline]
fn align_down(v: usize, align: usize) -> usize {
    v & !(align - 1)
}

fn requested_page_sizes(flags: MemzoneFlags) -> Vec<u64> {
    let mut sizes = Vec::new();
    if flags.contains(MemzoneFlags::PAGE_2MB) {
        sizes.push(PGSIZE_2M);
    }
    if flags.contains(MemzoneFlags::PAGE_1GB) {
        sizes.push(PGSIZE_1G);
    }
    if flags.contains(MemzoneFlags::PAGE_16MB) {
        sizes.push(PGSIZE_16M);
    }
    if flags.contains(MemzoneFlags::PAGE_16GB) {
        sizes.push(PGSIZE_16G);
    }
    sizes
}

/// Reserves a zone with cache-line alignment.
pub fn reserve(
    name: &str,
    len: usize,
    socket_id: i32,
    flags: MemzoneFlags,
) -> Result<&'static MemZone, RtError> {
    reserve_bounded(name, len, socket_id, flags, CACHE_LINE_SIZE, 0)
}

/// Reserves a zone with a caller-chosen alignment (power of two; values
/// below the cache line are raised to it).
pub fn reserve_aligned(
    name: &str,
    len: usize,
    socket_id: i32,
    flags: MemzoneFlags,
    align: usize,
) -> Result<&'static MemZone, RtError> {
    reserve_bounded(name, len, socket_id, flags, align, 0)
}

/// Reserves a zone that additionally must not cross a `bound`-aligned
/// address (`bound` = 0 disables the constraint).
pub fn reserve_bounded(
    name: &str,
    len: usize,
    socket_id: i32,
    flags: MemzoneFlags,
    align: usize,
    bound: usize,
) -> Result<&'static MemZone, RtError> {
    let cfg = crate::mem_config()?;
    cfg.mlock
        .with_write(|| reserve_locked(cfg, name, len, socket_id, flags, align, bound))
}

fn validate_name(name: &str) -> Result<(), RtError> {
    if name.is_empty() || name.len() >= NAMESIZE {
        return Err(RtError::invalid(format!(
            "zone name must be 1..{} characters: {name:?}",
            NAMESIZE - 1
        )));
    }
    Ok(())
}

fn reserve_locked(
    cfg: &'static crate::config::MemConfig,
    name: &str,
    len: usize,
    socket_id: i32,
    flags: MemzoneFlags,
    mut align: usize,
    bound: usize,
) -> Result<&'static MemZone, RtError> {
    validate_name(name)?;

    if align == 0 {
        align = CACHE_LINE_SIZE;
    }
    if !align.is_power_of_two() {
        return Err(RtError::invalid(format!(
            "alignment {align} is not a power of two"
        )));
    }
    if align < CACHE_LINE_SIZE {
        align = CACHE_LINE_SIZE;
    }
    if bound != 0 {
        if !bound.is_power_of_two() {
            return Err(RtError::invalid(format!(
                "boundary {bound} is not a power of two"
            )));
        }
        if len == 0 {
            return Err(RtError::invalid(
                "boundary constraint requires an explicit length",
            ));
        }
        if bound < len || bound < align {
            return Err(RtError::invalid(format!(
                "boundary {bound} smaller than length {len} or alignment {align}"
            )));
        }
    }

    // Name uniqueness and a free directory slot, in one scan.
    let mut free_slot = None;
    for idx in 0..MAX_MEMZONE {
        // SAFETY: mlock is held exclusive.
        let mz = unsafe { &*cfg.zone_slot(idx) };
        if mz.is_free() {
            free_slot.get_or_insert(idx);
        } else if mz.name_is(name) {
            return Err(RtError::AlreadyExists(name.to_owned()));
        }
    }
    let slot = free_slot.ok_or_else(|| RtError::NoMemory("memzone directory is full".into()))?;

    let want_len = if len == 0 {
        0
    } else {
        align_up(len, CACHE_LINE_SIZE)
    };

    // Page-size filter, retried without the filter under hint-only.
    let sizes = requested_page_sizes(flags);
    let strict = !sizes.is_empty();
    let placed = place(cfg, socket_id, &sizes, want_len, align, bound)
        .or_else(|| {
            if strict && flags.contains(MemzoneFlags::SIZE_HINT_ONLY) {
                place(cfg, socket_id, &[], want_len, align, bound)
            } else {
                None
            }
        });
    let Some((seg_idx, addr, zone_len)) = placed else {
        return Err(RtError::NoMemory(format!(
            "no free span fits zone {name:?} ({len} bytes, align {align}, bound {bound})"
        )));
    };

    let seg = cfg.memsegs()[seg_idx];
    // SAFETY: mlock is held exclusive; the slot was free.
    let mz = unsafe {
        let slot_ptr = cfg.zone_slot(slot);
        let mut entry: MemZone = std::mem::zeroed();
        entry.set_name(name);
        entry.addr = addr;
        entry.len = zone_len;
        entry.hugepage_sz = seg.hugepage_sz;
        entry.socket_id = seg.socket_id;
        entry.flags = flags.bits();
        entry.seg_idx = seg_idx as u32;
        slot_ptr.write(entry);
        &*slot_ptr
    };
    cfg.bump_memzones(1);
    debug!(
        target: "eal",
        "zone {name:?}: {zone_len} bytes at {addr:#x} (socket {})",
        seg.socket_id
    );
    Ok(mz)
}

/// First-fit placement. Returns `(segment index, address, length)`.
///
/// With `want_len` = 0 the largest aligned gap on a matching segment wins
/// instead, per the "as large as possible" reservation mode.
fn place(
    cfg: &crate::config::MemConfig,
    socket_id: i32,
    page_sizes: &[u64],
    want_len: usize,
    align: usize,
    bound: usize,
) -> Option<(usize, usize, usize)> {
    let mut best: Option<(usize, usize, usize)> = None;

    for (seg_idx, seg) in cfg.memsegs().iter().enumerate() {
        if socket_id != SOCKET_ID_ANY && seg.socket_id != socket_id {
            continue;
        }
        if !page_sizes.is_empty() && !page_sizes.contains(&seg.hugepage_sz) {
            continue;
        }

        // Live zones of this segment, in address order, bound the gaps.
        let mut used: Vec<(usize, usize)> = Vec::new();
        for idx in 0..MAX_MEMZONE {
            // SAFETY: callers hold mlock (exclusive).
            let mz = unsafe { &*cfg.zone_slot(idx) };
            if !mz.is_free() && mz.seg_idx as usize == seg_idx {
                used.push((mz.addr, mz.len));
            }
        }
        used.sort_unstable();

        let mut cursor = seg.addr;
        let mut gaps: Vec<(usize, usize)> = Vec::new();
        for &(zaddr, zlen) in &used {
            if zaddr > cursor {
                gaps.push((cursor, zaddr));
            }
            cursor = zaddr + zlen;
        }
        if cursor < seg.end() {
            gaps.push((cursor, seg.end()));
        }

        for (gap_start, gap_end) in gaps {
            let mut start = align_up(gap_start, align);
            if start >= gap_end {
                continue;
            }
            if want_len == 0 {
                let avail = align_down(gap_end - start, CACHE_LINE_SIZE);
                if avail > 0 && best.map_or(true, |(_, _, l)| avail > l) {
                    best = Some((seg_idx, start, avail));
                }
                continue;
            }
            if bound != 0 {
                // Slide to the next boundary window until the whole span
                // fits inside one window and inside the gap.
                loop {
                    let window_end = align_down(start, bound) + bound;
                    if start + want_len <= window_end {
                        break;
                    }
                    start = align_up(window_end, align);
                    if start >= gap_end {
                        break;
                    }
                }
                if start >= gap_end {
                    continue;
                }
            }
            if start + want_len <= gap_end {
                return Some((seg_idx, start, want_len));
            }
        }
    }
    best
}

/// Finds a zone by name.
pub fn lookup(name: &str) -> Result<&'static MemZone, RtError> {
    let cfg = crate::mem_config()?;
    cfg.mlock.with_read(|| {
        for idx in 0..MAX_MEMZONE {
            // SAFETY: mlock is held shared; live entries are immutable.
            let mz = unsafe { &*cfg.zone_slot(idx) };
            if mz.name_is(name) {
                return Ok(unsafe { &*cfg.zone_slot(idx) });
            }
        }
        Err(RtError::NotFound(name.to_owned()))
    })
}

/// Frees a zone, returning its span to the owning segment.
///
/// The descriptor must be one previously returned by a reserve or lookup;
/// anything else is rejected.
pub fn free(mz: &MemZone) -> Result<(), RtError> {
    let cfg = crate::mem_config()?;
    cfg.mlock.with_write(|| {
        let target = mz as *const MemZone;
        for idx in 0..MAX_MEMZONE {
            let slot = cfg.zone_slot(idx);
            if std::ptr::eq(slot as *const MemZone, target) {
                // SAFETY: mlock is held exclusive.
                let live = unsafe { !(*slot).is_free() };
                if !live {
                    break;
                }
                unsafe { slot.write(std::mem::zeroed()) };
                cfg.bump_memzones(-1);
                return Ok(());
            }
        }
        Err(RtError::invalid(
            "descriptor does not belong to the memzone directory",
        ))
    })
}

/// Calls `f` for every live zone. Reservation and free must not be invoked
/// from inside the callback (the directory lock is held shared).
pub fn walk(mut f: impl FnMut(&MemZone)) -> Result<(), RtError> {
    let cfg = crate::mem_config()?;
    cfg.mlock.with_read(|| {
        for idx in 0..MAX_MEMZONE {
            // SAFETY: mlock is held shared.
            let mz = unsafe { &*cfg.zone_slot(idx) };
            if !mz.is_free() {
                f(mz);
            }
        }
    });
    Ok(())
}

/// Logs every live zone at debug level.
pub fn dump() -> Result<(), RtError> {
    walk(|mz| {
        debug!(
            target: "eal",
            "zone {:?}: addr {:#x} len {} socket {} page_sz {}",
            mz.name(),
            mz.addr,
            mz.len,
            mz.socket_id,
            mz.hugepage_sz
        );
    })
}
