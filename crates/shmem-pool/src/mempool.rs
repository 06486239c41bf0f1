use crate::cache::{Cache, CACHE_MAX_SIZE};
use crate::ops;
use bitflags::bitflags;
#[cfg(debug_assertions)]
use crossbeam_utils::CachePadded;
use log::{debug, error};
use shmem_rt::{memzone, thread, MemzoneFlags, RtError, CACHE_LINE_SIZE, LCORE_ID_ANY, MAX_LCORE, NAMESIZE};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Memzone name prefix of pool descriptors (and of the backend ring name,
/// which the ring layer prefixes again).
pub const POOL_MZ_PREFIX: &str = "MP_";

/// Memzone name prefix of object chunk zones.
const CHUNK_MZ_PREFIX: &str = "MPC_";

/// Ceiling on backing memory chunks per pool. The original design keeps an
/// unbounded chunk list in heap memory; the general-purpose heap sits above
/// this layer, so the chunk table is bounded and lives inside the pool.
const MAX_MEM_CHUNKS: usize = 8;

const POOL_ALIGN: usize = CACHE_LINE_SIZE;

#[cfg(debug_assertions)]
const HDR_COOKIE_FREE: u64 = 0xf4ee_f4ee_d00d_2bad;
#[cfg(debug_assertions)]
const HDR_COOKIE_ALLOC: u64 = 0xa110_ca7e_d00d_2bad;
#[cfg(debug_assertions)]
const TLR_COOKIE: u64 = 0x7a11_c00c_1e5b_ad00;

bitflags! {
    /// Pool behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PoolFlags: u32 {
        /// Do not pad objects to spread them across memory channels/ranks.
        const NO_SPREAD = 0x0001;
        /// Do not cache-align objects (implies `NO_SPREAD`).
        const NO_CACHE_ALIGN = 0x0002;
        /// Default put path is single-producer.
        const SP_PUT = 0x0004;
        /// Default get path is single-consumer.
        const SC_GET = 0x0008;
        /// Internal: the backend has been allocated.
        const POOL_CREATED = 0x0010;
    }
}

/// Errors surfaced by pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("pool name already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid pool argument: {0}")]
    InvalidArgument(String),

    #[error("out of memory: {0}")]
    NoMemory(String),

    /// A bounded table (ops, chunks, population) is exhausted.
    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("pool not found: {0}")]
    NotFound(String),

    /// Not enough objects in the pool; nothing was transferred.
    #[error("no objects available")]
    NoObjects,

    /// The backend could not take the objects back.
    #[error("no room in pool backend")]
    NoBuffers,

    #[error(transparent)]
    Runtime(#[from] RtError),

    #[error(transparent)]
    Ring(#[from] shmem_ring::RingError),
}

/// Per-object size breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjSize {
    /// Bytes before the object (holds the object header at its tail).
    pub header_size: u32,
    /// Usable object bytes, 8-byte aligned.
    pub elt_size: u32,
    /// Bytes after the object (integrity trailer plus spread padding).
    pub trailer_size: u32,
    /// header + elt + trailer.
    pub total_size: u32,
}

/// Sits immediately before every object; links the object into the pool's
/// element list and back to its owner.
#[repr(C)]
struct ObjHeader {
    /// Address of the next object's header (0 terminates the list).
    next: usize,
    /// Address of the owning pool.
    pool: usize,
    #[cfg(debug_assertions)]
    cookie: u64,
}

#[cfg(debug_assertions)]
#[repr(C)]
struct ObjTrailer {
    cookie: u64,
}

/// One backing memory chunk.
#[repr(C)]
struct MemChunk {
    addr: AtomicUsize,
    len: AtomicUsize,
    populated: AtomicU32,
}

/// Per-lcore debug counters (debug builds only).
#[repr(C)]
#[derive(Default)]
pub struct PoolStats {
    pub put_bulk: AtomicU64,
    pub put_objs: AtomicU64,
    pub get_success_bulk: AtomicU64,
    pub get_success_objs: AtomicU64,
    pub get_fail_bulk: AtomicU64,
    pub get_fail_objs: AtomicU64,
}

/// A fixed-size object allocator in shared memory.
///
/// The descriptor, the per-lcore cache array and the private data area live
/// in one memzone; objects live in chunk memzones; free objects sit in the
/// backend (a shared ring by default) or in per-lcore caches.
///
/// Debug builds extend the layout with cookies and counters, so every
/// process of one instance must be built the same way.
#[repr(C)]
pub struct Mempool {
    name: [u8; NAMESIZE],
    pool_data: AtomicUsize,
    flags: AtomicU32,
    socket_id: i32,
    size: u32,
    cache_size: u32,
    elt_size: u32,
    header_size: u32,
    trailer_size: u32,
    private_data_size: u32,
    ops_index: AtomicI32,
    populated_size: AtomicU32,
    elt_list_head: AtomicUsize,
    nb_mem_chunks: AtomicU32,
    chunks: [MemChunk; MAX_MEM_CHUNKS],
    #[cfg(debug_assertions)]
    stats: [CachePadded<PoolStats>; MAX_LCORE],
}

#[inline]
fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Computes the per-object layout for the given element size and flags.
///
/// Unless spreading is disabled, the total size is padded so that object
/// starts hit every memory channel/rank combination evenly: the object's
/// cache-line count is grown until it is coprime with `channels * ranks`.
pub fn calc_obj_size(elt_size: u32, flags: PoolFlags, nchannel: u32, nrank: u32) -> ObjSize {
    let mut sz = ObjSize {
        header_size: std::mem::size_of::<ObjHeader>() as u32,
        elt_size: align_up(elt_size as usize, 8) as u32,
        trailer_size: 0,
        total_size: 0,
    };
    if !flags.contains(PoolFlags::NO_CACHE_ALIGN) {
        sz.header_size = align_up(sz.header_size as usize, POOL_ALIGN) as u32;
    }
    #[cfg(debug_assertions)]
    {
        sz.trailer_size = std::mem::size_of::<ObjTrailer>() as u32;
    }
    if !flags.contains(PoolFlags::NO_CACHE_ALIGN) {
        let total = sz.header_size + sz.elt_size + sz.trailer_size;
        sz.trailer_size += align_up(total as usize, POOL_ALIGN) as u32 - total;
    }
    if !flags.contains(PoolFlags::NO_SPREAD) {
        let nchan = if nchannel == 0 { 4 } else { nchannel };
        let nrank = if nrank == 0 { 1 } else { nrank };
        let obj = sz.header_size + sz.elt_size + sz.trailer_size;
        let mut lines = obj.div_ceil(POOL_ALIGN as u32);
        while gcd(lines, nrank * nchan) != 1 {
            lines += 1;
        }
        sz.trailer_size += lines * POOL_ALIGN as u32 - obj;
    }
    sz.total_size = sz.header_size + sz.elt_size + sz.trailer_size;
    sz
}

/// Descriptor-zone bytes for a pool with the given cache and private sizes.
fn pool_zone_len(cache_size: u32, private_data_size: u32) -> usize {
    let mut sz = std::mem::size_of::<Mempool>();
    if cache_size > 0 {
        sz += MAX_LCORE * std::mem::size_of::<Cache>();
    }
    sz = align_up(sz, CACHE_LINE_SIZE);
    sz + align_up(private_data_size as usize, CACHE_LINE_SIZE)
}

impl Mempool {
    // ---------------------------------------------------------------------
    // CREATION
    // ---------------------------------------------------------------------

    /// Creates a pool and populates it with `n` objects of `elt_size`
    /// bytes, running the optional pool constructor and per-object
    /// constructor.
    ///
    /// The backend is the shared ring matching the SP/SC flags. `cache_size`
    /// enables the per-lcore caches; it must stay at or below
    /// [`CACHE_MAX_SIZE`] and `n / 1.5`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &str,
        n: u32,
        elt_size: u32,
        cache_size: u32,
        private_data_size: u32,
        mp_init: Option<&dyn Fn(&Mempool)>,
        obj_init: Option<&dyn Fn(&Mempool, *mut u8, u32)>,
        socket_id: i32,
        flags: PoolFlags,
    ) -> Result<&'static Mempool, PoolError> {
        let mp = Self::create_empty(
            name,
            n,
            elt_size,
            cache_size,
            private_data_size,
            socket_id,
            flags,
        )?;

        let ops_name = match (
            flags.contains(PoolFlags::SP_PUT),
            flags.contains(PoolFlags::SC_GET),
        ) {
            (false, false) => "ring_mp_mc",
            (true, true) => "ring_sp_sc",
            (false, true) => "ring_mp_sc",
            (true, false) => "ring_sp_mc",
        };
        mp.set_ops_by_name(ops_name)?;

        if let Some(init) = mp_init {
            init(mp);
        }
        if let Err(e) = mp.populate_default() {
            let _ = Self::free(mp);
            return Err(e);
        }
        if let Some(init) = obj_init {
            mp.obj_iter(|mp, obj, idx| init(mp, obj, idx));
        }
        Ok(mp)
    }

    /// Allocates the pool descriptor without any backing object memory; the
    /// caller populates it later with [`Mempool::populate_default`] or
    /// [`Mempool::populate_virt`].
    pub fn create_empty(
        name: &str,
        n: u32,
        elt_size: u32,
        cache_size: u32,
        private_data_size: u32,
        socket_id: i32,
        mut flags: PoolFlags,
    ) -> Result<&'static Mempool, PoolError> {
        if n == 0 || elt_size == 0 {
            return Err(PoolError::InvalidArgument(
                "pool needs a positive object count and size".into(),
            ));
        }
        if name.is_empty() || name.len() + CHUNK_MZ_PREFIX.len() + 3 >= NAMESIZE {
            return Err(PoolError::InvalidArgument(format!(
                "pool name {name:?} too long"
            )));
        }
        if flags.contains(PoolFlags::POOL_CREATED) {
            return Err(PoolError::InvalidArgument("bad pool flags".into()));
        }
        // Cache must stay well below the pool size or objects get stranded.
        if cache_size > CACHE_MAX_SIZE || 3 * cache_size > 2 * n {
            return Err(PoolError::InvalidArgument(format!(
                "cache size {cache_size} too large for {n} objects"
            )));
        }
        if flags.contains(PoolFlags::NO_CACHE_ALIGN) {
            flags |= PoolFlags::NO_SPREAD;
        }

        let mem = shmem_rt::mem_config()?;
        let objsz = calc_obj_size(elt_size, flags, mem.nchannel, mem.nrank);

        let zone_len = pool_zone_len(cache_size, private_data_size);
        let mz = memzone::reserve(
            &format!("{POOL_MZ_PREFIX}{name}"),
            zone_len,
            socket_id,
            MemzoneFlags::empty(),
        )
        .map_err(|e| match e {
            RtError::AlreadyExists(_) => PoolError::AlreadyExists(name.to_owned()),
            RtError::NoMemory(m) => PoolError::NoMemory(m),
            other => PoolError::Runtime(other),
        })?;

        // SAFETY: fresh cache-line-aligned zone of `zone_len` bytes; zone
        // memory may be recycled, so reset it wholesale before typing it.
        let mp = unsafe {
            let base = mz.as_ptr();
            std::ptr::write_bytes(base, 0, zone_len);
            let mp = &mut *base.cast::<Mempool>();
            mp.name[..name.len()].copy_from_slice(name.as_bytes());
            mp.flags = AtomicU32::new(flags.bits());
            mp.socket_id = socket_id;
            mp.size = n;
            mp.cache_size = cache_size;
            mp.elt_size = objsz.elt_size;
            mp.header_size = objsz.header_size;
            mp.trailer_size = objsz.trailer_size;
            mp.private_data_size = private_data_size;
            mp.ops_index = AtomicI32::new(-1);
            if cache_size > 0 {
                let caches = base.add(std::mem::size_of::<Mempool>()).cast::<Cache>();
                for lcore in 0..MAX_LCORE {
                    Cache::init_at(caches.add(lcore), cache_size);
                }
            }
            &*base.cast::<Mempool>()
        };
        debug!(
            target: "mempool",
            "created pool {name:?}: {n} x {} bytes (total {} per object)",
            elt_size, objsz.total_size
        );
        Ok(mp)
    }

    /// Finds a pool created by any process of the instance.
    pub fn lookup(name: &str) -> Result<&'static Mempool, PoolError> {
        let mz = memzone::lookup(&format!("{POOL_MZ_PREFIX}{name}"))
            .map_err(|_| PoolError::NotFound(name.to_owned()))?;
        // SAFETY: the zone holds a pool initialized by `create_empty`.
        Ok(unsafe { &*mz.as_ptr().cast::<Mempool>() })
    }

    /// Calls `f` for every pool in the instance.
    pub fn walk(mut f: impl FnMut(&Mempool)) -> Result<(), PoolError> {
        memzone::walk(|mz| {
            let name = mz.name();
            if name.starts_with(POOL_MZ_PREFIX) && !name.starts_with(CHUNK_MZ_PREFIX) {
                // SAFETY: pool-prefixed zones are only created by
                // `create_empty`.
                f(unsafe { &*mz.as_ptr().cast::<Mempool>() });
            }
        })?;
        Ok(())
    }

    /// Frees the pool: backend, chunk zones and the descriptor zone.
    ///
    /// Objects must no longer be in use anywhere.
    pub fn free(mp: &'static Mempool) -> Result<(), PoolError> {
        let name = mp.name().to_owned();
        if mp.flags().contains(PoolFlags::POOL_CREATED) {
            if let Ok(ops) = ops::get_ops(mp.ops_index()) {
                if let Some(free) = ops.free {
                    free(mp);
                }
            }
        }
        let chunks = mp.nb_mem_chunks.load(Ordering::Relaxed);
        for idx in 0..chunks {
            if let Ok(mz) = memzone::lookup(&format!("{CHUNK_MZ_PREFIX}{name}_{idx}")) {
                memzone::free(mz)?;
            }
        }
        let mz = memzone::lookup(&format!("{POOL_MZ_PREFIX}{name}"))
            .map_err(|_| PoolError::NotFound(name.clone()))?;
        memzone::free(mz)?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // POPULATION
    // ---------------------------------------------------------------------

    fn ops_alloc_once(&self) -> Result<(), PoolError> {
        if self.flags().contains(PoolFlags::POOL_CREATED) {
            return Ok(());
        }
        if self.ops_index.load(Ordering::Acquire) < 0 {
            // Populating without an explicit backend choice gets the
            // multi-producer/multi-consumer ring.
            self.set_ops_by_name("ring_mp_mc")?;
        }
        let ops = ops::get_ops(self.ops_index())?;
        (ops.alloc.expect("validated at registration"))(self)?;
        self.flags
            .fetch_or(PoolFlags::POOL_CREATED.bits(), Ordering::Release);
        Ok(())
    }

    /// Adds a virtually contiguous chunk of memory and populates objects
    /// into it. Returns how many objects were added.
    pub fn populate_virt(&self, addr: *mut u8, len: usize) -> Result<u32, PoolError> {
        self.ops_alloc_once()?;

        let populated = self.populated_size.load(Ordering::Relaxed);
        if populated >= self.size {
            return Err(PoolError::NoSpace("pool is fully populated".into()));
        }
        let chunk_idx = self.nb_mem_chunks.load(Ordering::Relaxed) as usize;
        if chunk_idx >= MAX_MEM_CHUNKS {
            return Err(PoolError::NoSpace("pool chunk table is full".into()));
        }

        let total = (self.header_size + self.elt_size + self.trailer_size) as usize;
        let mut block = align_up(addr as usize, POOL_ALIGN);
        let end = addr as usize + len;
        let mut added = 0u32;

        while block + total <= end && self.populated_size.load(Ordering::Relaxed) < self.size {
            let obj = (block + self.header_size as usize) as *mut u8;
            // SAFETY: the chunk is exclusively ours during population; the
            // header slot sits immediately before the object.
            unsafe {
                let hdr = obj.sub(std::mem::size_of::<ObjHeader>()).cast::<ObjHeader>();
                (*hdr).pool = self as *const Self as usize;
                (*hdr).next = self.elt_list_head.load(Ordering::Relaxed);
                #[cfg(debug_assertions)]
                {
                    (*hdr).cookie = HDR_COOKIE_FREE;
                    let tlr = obj.add(self.elt_size as usize).cast::<ObjTrailer>();
                    (*tlr).cookie = TLR_COOKIE;
                }
                self.elt_list_head.store(hdr as usize, Ordering::Relaxed);
            }
            self.populated_size.fetch_add(1, Ordering::Relaxed);

            let ops = ops::get_ops(self.ops_index())?;
            (ops.enqueue.expect("validated at registration"))(self, &[obj])?;

            block += total;
            added += 1;
        }

        let chunk = &self.chunks[chunk_idx];
        chunk.addr.store(addr as usize, Ordering::Relaxed);
        chunk.len.store(len, Ordering::Relaxed);
        chunk.populated.store(added, Ordering::Relaxed);
        self.nb_mem_chunks
            .store(chunk_idx as u32 + 1, Ordering::Relaxed);
        Ok(added)
    }

    /// Reserves memzone-backed chunks until the pool holds all `size`
    /// objects. This is the population path `create` uses.
    pub fn populate_default(&self) -> Result<u32, PoolError> {
        self.ops_alloc_once()?;
        let total = (self.header_size + self.elt_size + self.trailer_size) as usize;
        let mut added = 0u32;
        while self.populated_size.load(Ordering::Relaxed) < self.size {
            let remaining = self.size - self.populated_size.load(Ordering::Relaxed);
            let need = remaining as usize * total + POOL_ALIGN;
            let mz_name = format!(
                "{CHUNK_MZ_PREFIX}{}_{}",
                self.name(),
                self.nb_mem_chunks.load(Ordering::Relaxed)
            );
            let mz = memzone::reserve(&mz_name, need, self.socket_id, MemzoneFlags::empty())
                .map_err(|e| match e {
                    RtError::NoMemory(m) => PoolError::NoMemory(m),
                    other => PoolError::Runtime(other),
                })?;
            added += self.populate_virt(mz.as_ptr(), mz.len)?;
        }
        Ok(added)
    }

    // ---------------------------------------------------------------------
    // ACCESSORS
    // ---------------------------------------------------------------------

    /// Pool name (without the memzone prefix).
    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAMESIZE);
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    #[inline]
    pub fn flags(&self) -> PoolFlags {
        PoolFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Maximum number of objects.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    #[inline]
    pub fn elt_size(&self) -> u32 {
        self.elt_size
    }

    #[inline]
    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    /// Objects installed so far.
    #[inline]
    pub fn populated_size(&self) -> u32 {
        self.populated_size.load(Ordering::Relaxed)
    }

    /// Opaque backend state (the default backend stores its ring address).
    #[inline]
    pub fn pool_data(&self) -> usize {
        self.pool_data.load(Ordering::Acquire)
    }

    /// Installs the opaque backend state; backend `alloc` callbacks call
    /// this.
    #[inline]
    pub fn set_pool_data(&self, data: usize) {
        self.pool_data.store(data, Ordering::Release);
    }

    #[inline]
    pub fn ops_index(&self) -> i32 {
        self.ops_index.load(Ordering::Acquire)
    }

    /// Selects the backend by registered name. Only possible before the
    /// pool has been populated.
    pub fn set_ops_by_name(&self, name: &str) -> Result<(), PoolError> {
        if self.flags().contains(PoolFlags::POOL_CREATED) {
            return Err(PoolError::AlreadyExists(
                "pool backend is already allocated".into(),
            ));
        }
        let idx = ops::lookup_ops(name).ok_or_else(|| {
            PoolError::InvalidArgument(format!("unknown pool backend {name:?}"))
        })?;
        self.ops_index.store(idx as i32, Ordering::Release);
        Ok(())
    }

    /// Start of the private data area.
    pub fn private_data(&self) -> *mut u8 {
        let mut off = std::mem::size_of::<Mempool>();
        if self.cache_size > 0 {
            off += MAX_LCORE * std::mem::size_of::<Cache>();
        }
        off = align_up(off, CACHE_LINE_SIZE);
        // SAFETY: the descriptor zone extends past the caches by
        // `private_data_size` bytes.
        unsafe { (self as *const Self as *mut u8).add(off) }
    }

    /// The pool owning `obj`.
    ///
    /// # Safety
    /// `obj` must be an object handed out by some pool of this instance.
    pub unsafe fn from_obj(obj: *mut u8) -> &'static Mempool {
        let hdr = obj.sub(std::mem::size_of::<ObjHeader>()).cast::<ObjHeader>();
        &*((*hdr).pool as *const Mempool)
    }

    // ---------------------------------------------------------------------
    // PER-LCORE CACHES
    // ---------------------------------------------------------------------

    fn cache_at(&self, lcore_id: u32) -> &Cache {
        debug_assert!(self.cache_size > 0 && (lcore_id as usize) < MAX_LCORE);
        // SAFETY: the cache array follows the descriptor in the zone; the
        // reference is handed to the owning thread only.
        unsafe {
            let base = (self as *const Self as *const u8)
                .add(std::mem::size_of::<Mempool>())
                .cast::<Cache>();
            &*base.add(lcore_id as usize)
        }
    }

    /// The calling thread's cache: its per-lcore slot for runtime threads,
    /// `None` for unregistered threads (which take the direct backend path
    /// or bring a [`Cache::user_owned`] one).
    pub fn default_cache(&self) -> Option<&Cache> {
        if self.cache_size == 0 {
            return None;
        }
        let lcore = thread::lcore_id();
        if lcore == LCORE_ID_ANY {
            return None;
        }
        Some(self.cache_at(lcore))
    }

    /// Drains a cache into the backend.
    pub fn cache_flush(&self, cache: &Cache) {
        let len = cache.len() as usize;
        if len == 0 {
            return;
        }
        // SAFETY: slot array owned by the calling thread.
        let objs = unsafe {
            std::slice::from_raw_parts(cache.objs_ptr().cast::<*mut u8>(), len)
        };
        self.backend_enqueue(objs);
        cache.set_len(0);
    }

    // ---------------------------------------------------------------------
    // PUT / GET
    // ---------------------------------------------------------------------

    fn backend_enqueue(&self, objs: &[*mut u8]) {
        let res = ops::get_ops(self.ops_index())
            .and_then(|ops| (ops.enqueue.expect("validated at registration"))(self, objs));
        if let Err(e) = res {
            // A pool can always take its own objects back; failure here
            // means corruption or a foreign object.
            if cfg!(debug_assertions) {
                panic!("cannot return objects to pool {:?}: {e}", self.name());
            }
            error!(target: "mempool", "cannot return objects to pool {:?}: {e}", self.name());
        }
    }

    /// Returns objects to the pool through `cache` (pass
    /// [`Mempool::default_cache`] or a caller-owned cache).
    pub fn generic_put(&self, objs: &[*mut u8], cache: Option<&Cache>) {
        if objs.is_empty() {
            return;
        }
        #[cfg(debug_assertions)]
        self.check_cookies(objs, CookieMode::OnPut);
        self.with_stats(|s| {
            s.put_bulk.fetch_add(1, Ordering::Relaxed);
            s.put_objs.fetch_add(objs.len() as u64, Ordering::Relaxed);
        });

        let usable = cache.filter(|c| c.size() > 0 && objs.len() <= CACHE_MAX_SIZE as usize);
        let Some(cache) = usable else {
            self.backend_enqueue(objs);
            return;
        };

        // Append to the top of the cache...
        let len = cache.len() as usize;
        let base = cache.objs_ptr();
        for (i, &obj) in objs.iter().enumerate() {
            // SAFETY: the inline array holds 3x the maximum cache size, and
            // len never exceeds the flush threshold (1.5x) before a drain.
            unsafe { base.add(len + i).write(obj as usize) };
        }
        let len = len + objs.len();
        cache.set_len(len as u32);

        // ...then drain everything above the steady-state size in one bulk
        // enqueue once the threshold is crossed.
        if len >= cache.flush_threshold() as usize {
            let keep = cache.size() as usize;
            // SAFETY: slots [keep, len) are initialized; owned by this
            // thread.
            let excess = unsafe {
                std::slice::from_raw_parts(base.add(keep).cast::<*mut u8>(), len - keep)
            };
            self.backend_enqueue(excess);
            cache.set_len(keep as u32);
        }
    }

    /// Returns objects through the calling thread's default cache.
    pub fn put_bulk(&self, objs: &[*mut u8]) {
        self.generic_put(objs, self.default_cache());
    }

    /// Returns one object.
    pub fn put(&self, obj: *mut u8) {
        self.put_bulk(&[obj]);
    }

    fn backend_dequeue(&self, out: &mut [*mut u8]) -> Result<(), PoolError> {
        let ops = ops::get_ops(self.ops_index())?;
        (ops.dequeue.expect("validated at registration"))(self, out)
    }

    /// Takes `out.len()` objects from the pool, or none at all.
    ///
    /// Satisfied from `cache` first; the cache refills from the backend in
    /// one bulk dequeue when short.
    pub fn generic_get(&self, out: &mut [*mut u8], cache: Option<&Cache>) -> Result<(), PoolError> {
        let n = out.len();
        if n == 0 {
            return Ok(());
        }

        'cache: {
            let Some(cache) = cache else { break 'cache };
            if cache.size() == 0 || n >= cache.size() as usize {
                break 'cache;
            }
            let len = cache.len() as usize;
            let base = cache.objs_ptr();
            if len < n {
                // Refill to steady state plus the request in one shot; on
                // failure fall through to the direct path rather than
                // stranding a partial refill.
                let req = n + (cache.size() as usize - len);
                // SAFETY: the inline array has room: len + req <= 2x size
                // <= 3x the maximum cache size.
                let fill = unsafe {
                    std::slice::from_raw_parts_mut(base.add(len).cast::<*mut u8>(), req)
                };
                if self.backend_dequeue(fill).is_err() {
                    break 'cache;
                }
                cache.set_len((len + req) as u32);
            }

            // Serve LIFO from the top for temporal locality.
            let len = cache.len() as usize;
            for (i, slot) in out.iter_mut().enumerate() {
                // SAFETY: slots below len are initialized; owned by this
                // thread.
                *slot = unsafe { base.add(len - 1 - i).read() } as *mut u8;
            }
            cache.set_len((len - n) as u32);

            self.with_stats(|s| {
                s.get_success_bulk.fetch_add(1, Ordering::Relaxed);
                s.get_success_objs.fetch_add(n as u64, Ordering::Relaxed);
            });
            #[cfg(debug_assertions)]
            self.check_cookies(out, CookieMode::OnGet);
            return Ok(());
        }

        match self.backend_dequeue(out) {
            Ok(()) => {
                self.with_stats(|s| {
                    s.get_success_bulk.fetch_add(1, Ordering::Relaxed);
                    s.get_success_objs.fetch_add(n as u64, Ordering::Relaxed);
                });
                #[cfg(debug_assertions)]
                self.check_cookies(out, CookieMode::OnGet);
                Ok(())
            }
            Err(_) => {
                self.with_stats(|s| {
                    s.get_fail_bulk.fetch_add(1, Ordering::Relaxed);
                    s.get_fail_objs.fetch_add(n as u64, Ordering::Relaxed);
                });
                Err(PoolError::NoObjects)
            }
        }
    }

    /// Takes objects through the calling thread's default cache.
    pub fn get_bulk(&self, out: &mut [*mut u8]) -> Result<(), PoolError> {
        self.generic_get(out, self.default_cache())
    }

    /// Takes one object.
    pub fn get(&self) -> Result<*mut u8, PoolError> {
        let mut out = [std::ptr::null_mut(); 1];
        self.get_bulk(&mut out)?;
        Ok(out[0])
    }

    // ---------------------------------------------------------------------
    // COUNTS
    // ---------------------------------------------------------------------

    /// Free objects: backend availability plus every per-lcore cache.
    ///
    /// Walks all caches, so it is for inspection, not the data path.
    pub fn avail_count(&self) -> u32 {
        let mut count = ops::get_ops(self.ops_index())
            .ok()
            .and_then(|ops| ops.get_count.map(|f| f(self)))
            .unwrap_or(0);
        if self.cache_size > 0 {
            for lcore in 0..MAX_LCORE as u32 {
                count += self.cache_at(lcore).len();
            }
        }
        // Data-path races can make the sum overshoot momentarily.
        count.min(self.size)
    }

    /// Objects currently handed out.
    pub fn in_use_count(&self) -> u32 {
        self.size - self.avail_count()
    }

    pub fn is_full(&self) -> bool {
        self.avail_count() == self.size
    }

    pub fn is_empty(&self) -> bool {
        self.avail_count() == 0
    }

    // ---------------------------------------------------------------------
    // ITERATION
    // ---------------------------------------------------------------------

    /// Calls `f` for every populated object. Returns the visit count.
    pub fn obj_iter(&self, mut f: impl FnMut(&Mempool, *mut u8, u32)) -> u32 {
        let mut idx = 0u32;
        let mut hdr_addr = self.elt_list_head.load(Ordering::Acquire);
        while hdr_addr != 0 {
            // SAFETY: list links were installed during population and are
            // immutable afterwards.
            unsafe {
                let hdr = hdr_addr as *const ObjHeader;
                let obj = (hdr_addr + std::mem::size_of::<ObjHeader>()) as *mut u8;
                f(self, obj, idx);
                hdr_addr = (*hdr).next;
            }
            idx += 1;
        }
        idx
    }

    /// Calls `f` for every backing chunk with `(pool, addr, len, index)`.
    pub fn mem_iter(&self, mut f: impl FnMut(&Mempool, *mut u8, usize, u32)) -> u32 {
        let n = self.nb_mem_chunks.load(Ordering::Relaxed);
        for idx in 0..n {
            let chunk = &self.chunks[idx as usize];
            f(
                self,
                chunk.addr.load(Ordering::Relaxed) as *mut u8,
                chunk.len.load(Ordering::Relaxed),
                idx,
            );
        }
        n
    }

    // ---------------------------------------------------------------------
    // INTEGRITY & STATS (debug builds)
    // ---------------------------------------------------------------------

    #[cfg(debug_assertions)]
    fn with_stats(&self, f: impl FnOnce(&PoolStats)) {
        let lcore = thread::lcore_id();
        if lcore != LCORE_ID_ANY {
            f(&self.stats[lcore as usize]);
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn with_stats(&self, _f: impl FnOnce(&PoolStats)) {}

    /// Debug counters of one lcore (debug builds only).
    #[cfg(debug_assertions)]
    pub fn stats(&self, lcore_id: u32) -> &PoolStats {
        &self.stats[lcore_id as usize]
    }
}

#[cfg(debug_assertions)]
#[derive(Clone, Copy, PartialEq, Eq)]
enum CookieMode {
    /// Objects are coming back: they must carry the allocated cookie and
    /// are re-marked free.
    OnPut,
    /// Objects are going out: they must carry the free cookie and are
    /// re-marked allocated.
    OnGet,
}

#[cfg(debug_assertions)]
impl Mempool {
    fn check_cookies(&self, objs: &[*mut u8], mode: CookieMode) {
        for &obj in objs {
            // SAFETY: objects were laid out by population with header and
            // trailer in place.
            unsafe {
                let hdr = obj.sub(std::mem::size_of::<ObjHeader>()).cast::<ObjHeader>();
                assert!(
                    std::ptr::eq((*hdr).pool as *const Mempool, self),
                    "object {obj:p} put to foreign pool {:?}",
                    self.name()
                );
                let cookie = (*hdr).cookie;
                match mode {
                    CookieMode::OnPut => {
                        assert!(
                            cookie != HDR_COOKIE_FREE,
                            "double free of object {obj:p} in pool {:?}",
                            self.name()
                        );
                        assert!(
                            cookie == HDR_COOKIE_ALLOC,
                            "bad header cookie on put of {obj:p}"
                        );
                        (*hdr).cookie = HDR_COOKIE_FREE;
                    }
                    CookieMode::OnGet => {
                        assert!(
                            cookie == HDR_COOKIE_FREE,
                            "bad header cookie on get of {obj:p}"
                        );
                        (*hdr).cookie = HDR_COOKIE_ALLOC;
                    }
                }
                let tlr = obj.add(self.elt_size as usize).cast::<ObjTrailer>();
                assert!(
                    (*tlr).cookie == TLR_COOKIE,
                    "bad trailer cookie on {obj:p} (overwrite past the object?)"
                );
            }
        }
    }
}

impl std::fmt::Debug for Mempool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mempool")
            .field("name", &self.name())
            .field("size", &self.size)
            .field("elt_size", &self.elt_size)
            .field("cache_size", &self.cache_size)
            .field("populated", &self.populated_size())
            .field("avail", &self.avail_count())
            .field("flags", &self.flags())
            .field("ops_index", &self.ops_index())
            .finish()
    }
}
