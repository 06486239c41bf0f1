use bitflags::bitflags;
use crossbeam_utils::{Backoff, CachePadded};
use log::debug;
use shmem_rt::{memzone, MemzoneFlags, RtError, NAMESIZE};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

// =============================================================================
// MEMORY ORDERING & SYNCHRONIZATION STRATEGY
// =============================================================================
//
// The ring uses four monotonically increasing u32 counters, forming two
// head/tail pairs. Indexes are `counter & mask`; the counters themselves
// never wrap logically (u32 wrapping arithmetic keeps the differences
// correct).
//
// ## Producer protocol (multi-producer)
//
// 1. Load `prod.head` (Relaxed) and `cons.tail` (Acquire - synchronizes
//    with consumers finishing their slot reads, so we never overwrite a
//    slot still being read).
// 2. free = capacity - (prod.head - cons.tail). Bulk gives up when
//    free < n, burst clamps n.
// 3. CAS `prod.head` forward by n (Relaxed; publication happens via the
//    tail, not the head). Retry on contention.
// 4. Write the reserved slots (plain stores - the [head, head+n) span is
//    exclusively owned between head reservation and tail publication).
// 5. Wait until `prod.tail` equals the observed head (Acquire, bounded
//    spin: earlier producers must publish first), then store
//    `prod.tail = head + n` (Release - publishes the slot writes).
//
// The single-producer path skips the CAS and the tail wait; the producer
// owns both counters.
//
// ## Consumer protocol
//
// Exactly the mirror image on `cons.head`/`cons.tail` against `prod.tail`.
// The Acquire load of `prod.tail` pairs with the producer's Release store,
// so a dequeued slot is always read after the matching enqueue's writes.
// The Release store of `cons.tail` pairs with the producer's Acquire load
// of it, handing the slot back for reuse.
//
// =============================================================================

/// Ring size ceiling; `size` must not exceed this.
pub const RING_SZ_MASK: u32 = 0x7fff_ffff;

/// Memzone name prefix for rings; ring discovery goes through the memzone
/// directory.
pub const RING_MZ_PREFIX: &str = "RG_";

bitflags! {
    /// Construction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RingFlags: u32 {
        /// The ring only ever has one producer.
        const SP_ENQ = 0x0001;
        /// The ring only ever has one consumer.
        const SC_DEQ = 0x0002;
        /// Usable capacity is exactly the requested count (the slot array
        /// is rounded up to a power of two internally).
        const EXACT_SZ = 0x0004;
    }
}

/// Errors surfaced by ring operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    /// Bad size (not a power of two, or above [`RING_SZ_MASK`]) or name.
    #[error("invalid ring argument: {0}")]
    InvalidArgument(String),

    /// A ring with this name already exists.
    #[error("ring name already exists: {0}")]
    AlreadyExists(String),

    /// No memzone space for the ring.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Lookup miss.
    #[error("ring not found: {0}")]
    NotFound(String),

    /// Bulk enqueue could not fit all entries.
    #[error("not enough room in ring")]
    Full,

    /// Bulk dequeue could not supply all entries.
    #[error("ring is empty")]
    Empty,

    /// Runtime-level failure (uninitialized runtime and friends).
    #[error(transparent)]
    Runtime(#[from] RtError),
}

/// One half of the ring: a head/tail counter pair.
#[repr(C)]
struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
    /// 1 when this side has a single participant (no CAS, no tail wait).
    single: u32,
}

/// The shared ring descriptor; the slot array follows it in the same
/// memzone.
#[repr(C)]
pub struct Ring {
    name: [u8; NAMESIZE],
    flags: u32,
    size: u32,
    mask: u32,
    capacity: u32,
    /// Producer half, padded so producers and consumers do not share a
    /// cache line.
    prod: CachePadded<HeadTail>,
    /// Consumer half.
    cons: CachePadded<HeadTail>,
}

impl Ring {
    // ---------------------------------------------------------------------
    // CONSTRUCTION & DISCOVERY
    // ---------------------------------------------------------------------

    /// Bytes needed for a ring with `slots` slots.
    fn memsize(slots: u32) -> usize {
        std::mem::size_of::<Ring>() + slots as usize * std::mem::size_of::<usize>()
    }

    fn size_params(count: u32, flags: RingFlags) -> Result<(u32, u32), RingError> {
        if flags.contains(RingFlags::EXACT_SZ) {
            if count >= RING_SZ_MASK {
                return Err(RingError::InvalidArgument(format!(
                    "requested capacity {count} above the size mask"
                )));
            }
            let size = (count + 1).next_power_of_two();
            Ok((size, count))
        } else {
            if !count.is_power_of_two() || count > RING_SZ_MASK {
                return Err(RingError::InvalidArgument(format!(
                    "ring size {count} must be a power of two within the size mask"
                )));
            }
            Ok((count, count - 1))
        }
    }

    /// Initializes a ring header in place. The memory must span
    /// [`Ring::memsize`] bytes and be cache-line aligned.
    unsafe fn init_at(mem: *mut u8, name: &str, count: u32, flags: RingFlags) -> &'static Ring {
        let (size, capacity) = Self::size_params(count, flags).expect("validated by caller");
        std::ptr::write_bytes(mem, 0, Self::memsize(size));
        let ring = &mut *mem.cast::<Ring>();
        ring.name[..name.len()].copy_from_slice(name.as_bytes());
        ring.flags = flags.bits();
        ring.size = size;
        ring.mask = size - 1;
        ring.capacity = capacity;
        ring.prod.single = u32::from(flags.contains(RingFlags::SP_ENQ));
        ring.cons.single = u32::from(flags.contains(RingFlags::SC_DEQ));
        ring
    }

    /// Creates a ring named `name` inside a fresh memzone.
    ///
    /// In the default mode `count` must be a power of two and the usable
    /// capacity is `count - 1`; with [`RingFlags::EXACT_SZ`] the capacity
    /// is exactly `count`.
    pub fn create(
        name: &str,
        count: u32,
        socket_id: i32,
        flags: RingFlags,
    ) -> Result<&'static Ring, RingError> {
        let (size, _) = Self::size_params(count, flags)?;
        if name.is_empty() || name.len() + RING_MZ_PREFIX.len() >= NAMESIZE {
            return Err(RingError::InvalidArgument(format!(
                "ring name {name:?} too long"
            )));
        }
        let mz_name = format!("{RING_MZ_PREFIX}{name}");
        let mz = memzone::reserve(&mz_name, Self::memsize(size), socket_id, MemzoneFlags::empty())
            .map_err(|e| match e {
                RtError::AlreadyExists(_) => RingError::AlreadyExists(name.to_owned()),
                RtError::NoMemory(m) => RingError::NoMemory(m),
                RtError::InvalidArgument(m) => RingError::InvalidArgument(m),
                other => RingError::Runtime(other),
            })?;
        // SAFETY: the zone is fresh, cache-line aligned and large enough.
        let ring = unsafe { Self::init_at(mz.as_ptr(), name, count, flags) };
        debug!(
            target: "ring",
            "created ring {name:?}: size {} capacity {}", ring.size, ring.capacity
        );
        Ok(ring)
    }

    /// Finds a ring created by any process of the instance.
    pub fn lookup(name: &str) -> Result<&'static Ring, RingError> {
        let mz = memzone::lookup(&format!("{RING_MZ_PREFIX}{name}"))
            .map_err(|_| RingError::NotFound(name.to_owned()))?;
        // SAFETY: the zone was initialized by `create` in some process and
        // is mapped at the same address here.
        Ok(unsafe { &*mz.as_ptr().cast::<Ring>() })
    }

    /// Frees the ring, removing its backing memzone.
    ///
    /// The caller is responsible for quiescing all users first.
    pub fn free(ring: &'static Ring) -> Result<(), RingError> {
        let mz = memzone::lookup(&format!("{RING_MZ_PREFIX}{}", ring.name()))
            .map_err(|_| RingError::NotFound(ring.name().to_owned()))?;
        memzone::free(mz).map_err(RingError::Runtime)
    }

    // ---------------------------------------------------------------------
    // STATUS
    // ---------------------------------------------------------------------

    /// Ring name (without the memzone prefix).
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAMESIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Construction flags.
    pub fn flags(&self) -> RingFlags {
        RingFlags::from_bits_truncate(self.flags)
    }

    /// Number of slots (power of two).
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Usable capacity.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Entries currently in the ring.
    #[inline]
    pub fn count(&self) -> u32 {
        let prod_tail = self.prod.tail.load(Ordering::Relaxed);
        let cons_tail = self.cons.tail.load(Ordering::Relaxed);
        prod_tail.wrapping_sub(cons_tail).min(self.capacity)
    }

    /// Free entries.
    #[inline]
    pub fn free_count(&self) -> u32 {
        self.capacity - self.count()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    #[inline]
    fn slots(&self) -> *mut usize {
        // SAFETY: the slot array follows the header in the same zone;
        // size_of::<Ring>() is a multiple of the 128-byte header alignment.
        unsafe { (self as *const Ring as *mut u8).add(std::mem::size_of::<Ring>()) }.cast()
    }

    // ---------------------------------------------------------------------
    // CORE PROTOCOL
    // ---------------------------------------------------------------------

    fn move_prod_head(&self, is_sp: bool, n: u32, fixed: bool) -> Option<(u32, u32)> {
        loop {
            let head = self.prod.head.load(Ordering::Relaxed);
            let cons_tail = self.cons.tail.load(Ordering::Acquire);
            let free = self.capacity.wrapping_add(cons_tail).wrapping_sub(head);
            let take = if free >= n {
                n
            } else if fixed {
                0
            } else {
                free
            };
            if take == 0 {
                return None;
            }
            let new = head.wrapping_add(take);
            if is_sp {
                self.prod.head.store(new, Ordering::Relaxed);
                return Some((head, take));
            }
            if self
                .prod
                .head
                .compare_exchange_weak(head, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some((head, take));
            }
        }
    }

    fn move_cons_head(&self, is_sc: bool, n: u32, fixed: bool) -> Option<(u32, u32)> {
        loop {
            let head = self.cons.head.load(Ordering::Relaxed);
            let prod_tail = self.prod.tail.load(Ordering::Acquire);
            let avail = prod_tail.wrapping_sub(head);
            let take = if avail >= n {
                n
            } else if fixed {
                0
            } else {
                avail
            };
            if take == 0 {
                return None;
            }
            let new = head.wrapping_add(take);
            if is_sc {
                self.cons.head.store(new, Ordering::Relaxed);
                return Some((head, take));
            }
            if self
                .cons
                .head
                .compare_exchange_weak(head, new, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some((head, take));
            }
        }
    }

    /// Waits for earlier reservations on the same side to publish, then
    /// publishes ours. Lock-free but not wait-free: bounded by the earlier
    /// participants' progress.
    fn update_tail(ht: &HeadTail, old: u32, new: u32) {
        if ht.single == 0 {
            let backoff = Backoff::new();
            while ht.tail.load(Ordering::Acquire) != old {
                backoff.snooze();
            }
        }
        ht.tail.store(new, Ordering::Release);
    }

    fn do_enqueue(&self, objs: &[*mut u8], is_sp: bool, fixed: bool) -> usize {
        let n = objs.len() as u32;
        if n == 0 {
            return 0;
        }
        let Some((head, take)) = self.move_prod_head(is_sp, n, fixed) else {
            return 0;
        };
        let slots = self.slots();
        for (i, &obj) in objs[..take as usize].iter().enumerate() {
            let idx = (head.wrapping_add(i as u32) & self.mask) as usize;
            // SAFETY: the reserved span is exclusively ours until the tail
            // is published.
            unsafe { slots.add(idx).write(obj as usize) };
        }
        Self::update_tail(&self.prod, head, head.wrapping_add(take));
        take as usize
    }

    fn do_dequeue(&self, out: &mut [*mut u8], is_sc: bool, fixed: bool) -> usize {
        let n = out.len() as u32;
        if n == 0 {
            return 0;
        }
        let Some((head, take)) = self.move_cons_head(is_sc, n, fixed) else {
            return 0;
        };
        let slots = self.slots();
        for (i, out_slot) in out[..take as usize].iter_mut().enumerate() {
            let idx = (head.wrapping_add(i as u32) & self.mask) as usize;
            // SAFETY: slots in [head, head+take) were published by the
            // producers' release stores, observed by our acquire load.
            *out_slot = unsafe { slots.add(idx).read() } as *mut u8;
        }
        Self::update_tail(&self.cons, head, head.wrapping_add(take));
        take as usize
    }

    #[inline]
    fn default_sp(&self) -> bool {
        self.prod.single != 0
    }

    #[inline]
    fn default_sc(&self) -> bool {
        self.cons.single != 0
    }

    // ---------------------------------------------------------------------
    // PRODUCER API
    // ---------------------------------------------------------------------

    /// Enqueues all of `objs`, or nothing. Returns the number enqueued
    /// (`objs.len()` or 0).
    pub fn enqueue_bulk(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, self.default_sp(), true)
    }

    /// Enqueues as many of `objs` as fit; returns how many were taken.
    pub fn enqueue_burst(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, self.default_sp(), false)
    }

    /// Enqueues one entry.
    pub fn enqueue(&self, obj: *mut u8) -> Result<(), RingError> {
        if self.enqueue_bulk(&[obj]) == 1 {
            Ok(())
        } else {
            Err(RingError::Full)
        }
    }

    /// Multi-producer bulk enqueue, regardless of the construction flags.
    pub fn mp_enqueue_bulk(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, false, true)
    }

    /// Single-producer bulk enqueue, regardless of the construction flags.
    pub fn sp_enqueue_bulk(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, true, true)
    }

    /// Multi-producer burst enqueue.
    pub fn mp_enqueue_burst(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, false, false)
    }

    /// Single-producer burst enqueue.
    pub fn sp_enqueue_burst(&self, objs: &[*mut u8]) -> usize {
        self.do_enqueue(objs, true, false)
    }

    // ---------------------------------------------------------------------
    // CONSUMER API
    // ---------------------------------------------------------------------

    /// Dequeues exactly `out.len()` entries, or nothing. Returns the number
    /// dequeued.
    pub fn dequeue_bulk(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, self.default_sc(), true)
    }

    /// Dequeues up to `out.len()` entries; returns how many arrived.
    pub fn dequeue_burst(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, self.default_sc(), false)
    }

    /// Dequeues one entry.
    pub fn dequeue(&self) -> Result<*mut u8, RingError> {
        let mut out = [std::ptr::null_mut(); 1];
        if self.dequeue_bulk(&mut out) == 1 {
            Ok(out[0])
        } else {
            Err(RingError::Empty)
        }
    }

    /// Multi-consumer bulk dequeue, regardless of the construction flags.
    pub fn mc_dequeue_bulk(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, false, true)
    }

    /// Single-consumer bulk dequeue.
    pub fn sc_dequeue_bulk(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, true, true)
    }

    /// Multi-consumer burst dequeue.
    pub fn mc_dequeue_burst(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, false, false)
    }

    /// Single-consumer burst dequeue.
    pub fn sc_dequeue_burst(&self, out: &mut [*mut u8]) -> usize {
        self.do_dequeue(out, true, false)
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("name", &self.name())
            .field("flags", &self.flags())
            .field("size", &self.size)
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .field("prod_head", &self.prod.head.load(Ordering::Relaxed))
            .field("prod_tail", &self.prod.tail.load(Ordering::Relaxed))
            .field("cons_head", &self.cons.head.load(Ordering::Relaxed))
            .field("cons_tail", &self.cons.tail.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a ring on the heap, bypassing the memzone layer; layout and
    /// protocol are identical.
    fn heap_ring(count: u32, flags: RingFlags) -> &'static Ring {
        let (size, _) = Ring::size_params(count, flags).unwrap();
        let layout =
            std::alloc::Layout::from_size_align(Ring::memsize(size), 128).unwrap();
        unsafe {
            let mem = std::alloc::alloc(layout);
            assert!(!mem.is_null());
            Ring::init_at(mem, "test", count, flags)
        }
    }

    fn ptrs(range: std::ops::Range<usize>) -> Vec<*mut u8> {
        range.map(|i| (i + 1) as *mut u8).collect()
    }

    #[test]
    fn size_validation() {
        assert!(Ring::size_params(0, RingFlags::empty()).is_err());
        assert!(Ring::size_params(24, RingFlags::empty()).is_err());
        assert!(Ring::size_params(1 << 31, RingFlags::empty()).is_err());
        assert_eq!(Ring::size_params(16, RingFlags::empty()).unwrap(), (16, 15));
        assert_eq!(
            Ring::size_params(16, RingFlags::EXACT_SZ).unwrap(),
            (32, 16)
        );
    }

    #[test]
    fn bulk_roundtrip_preserves_order() {
        let r = heap_ring(64, RingFlags::empty());
        let src = ptrs(0..48);
        assert_eq!(r.enqueue_bulk(&src), 48);
        assert_eq!(r.count(), 48);

        let mut dst = vec![std::ptr::null_mut(); 48];
        assert_eq!(r.dequeue_bulk(&mut dst), 48);
        assert_eq!(src, dst);
        assert!(r.is_empty());
    }

    #[test]
    fn bulk_is_all_or_nothing() {
        let r = heap_ring(16, RingFlags::empty());
        assert_eq!(r.enqueue_bulk(&ptrs(0..10)), 10);
        // 5 free slots left (capacity 15): a 6-entry bulk fails whole.
        assert_eq!(r.enqueue_bulk(&ptrs(0..6)), 0);
        assert_eq!(r.enqueue_bulk(&ptrs(0..5)), 5);
        assert!(r.is_full());
    }

    #[test]
    fn burst_clamps() {
        let r = heap_ring(16, RingFlags::empty());
        assert_eq!(r.enqueue_burst(&ptrs(0..20)), 15);
        assert!(r.is_full());
        let mut out = vec![std::ptr::null_mut(); 20];
        assert_eq!(r.dequeue_burst(&mut out), 15);
        assert!(r.is_empty());
        assert_eq!(r.dequeue_burst(&mut out), 0);
    }

    #[test]
    fn exact_size_takes_full_count() {
        let r = heap_ring(16, RingFlags::EXACT_SZ);
        assert_eq!(r.capacity(), 16);
        for i in 0..16 {
            r.enqueue(i as *mut u8).unwrap();
        }
        assert_eq!(r.enqueue(std::ptr::null_mut()), Err(RingError::Full));
    }

    #[test]
    fn counter_wraparound_is_transparent() {
        let r = heap_ring(8, RingFlags::empty());
        // Force the 32-bit counters close to the wrap point.
        r.prod.head.store(u32::MAX - 3, Ordering::Relaxed);
        r.prod.tail.store(u32::MAX - 3, Ordering::Relaxed);
        r.cons.head.store(u32::MAX - 3, Ordering::Relaxed);
        r.cons.tail.store(u32::MAX - 3, Ordering::Relaxed);

        let src = ptrs(0..7);
        assert_eq!(r.enqueue_bulk(&src), 7);
        assert!(r.is_full());
        let mut dst = vec![std::ptr::null_mut(); 7];
        assert_eq!(r.dequeue_bulk(&mut dst), 7);
        assert_eq!(src, dst);
        assert!(r.is_empty());
    }

    #[test]
    fn mp_mc_soak() {
        use std::collections::HashSet;
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        const PER_PRODUCER: usize = 20_000;
        let r = heap_ring(1024, RingFlags::empty());
        let consumed = AtomicUsize::new(0);

        thread::scope(|s| {
            for p in 0..2 {
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let val = (p * PER_PRODUCER + i + 1) as *mut u8;
                        let backoff = Backoff::new();
                        while r.mp_enqueue_bulk(&[val]) == 0 {
                            backoff.snooze();
                        }
                    }
                });
            }
            let consumed = &consumed;
            let seen: thread::ScopedJoinHandle<'_, HashSet<usize>> = s.spawn(move || {
                let mut seen = HashSet::new();
                let mut out = vec![std::ptr::null_mut(); 32];
                while consumed.load(Ordering::Relaxed) < 2 * PER_PRODUCER {
                    let n = r.mc_dequeue_burst(&mut out);
                    for &p in &out[..n] {
                        assert!(seen.insert(p as usize), "duplicate delivery");
                    }
                    consumed.fetch_add(n, Ordering::Relaxed);
                }
                seen
            });
            let seen = seen.join().unwrap();
            assert_eq!(seen.len(), 2 * PER_PRODUCER);
        });
        assert!(r.is_empty());
    }
}
