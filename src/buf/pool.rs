//! The pooled allocator: a buddy-tree chunk arena for page-and-larger
//! requests, bitmap-tracked subpages for anything smaller than a page, and
//! a thread-local cache in front of both (`pool_thread_cache`).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::bytebuf::{ArenaReturn, ByteBuf, PoolAllocKind, PoolAllocation};
use super::leak::{LeakDetectionLevel, LeakDetector};
use super::pool_thread_cache as cache;
use super::{BufError, BufResult, ByteBufAllocator};

/// Recognized pool options (spec §6.3).
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Independent lock domains. Default is roughly 2x the expected number
    /// of worker threads so arenas rarely contend.
    pub arena_count: usize,
    /// Leaf page size; must be a power of two.
    pub page_size: usize,
    /// Chunk tree depth; chunk size is `page_size * 2^max_order`.
    pub max_order: u32,
    /// Per-thread, per-size-class cache capacity for small (sub-page)
    /// allocations.
    pub small_cache_size: usize,
    /// Per-thread, per-size-class cache capacity for normal (page or
    /// larger) allocations.
    pub normal_cache_size: usize,
    /// Allocations between automatic cache trim passes. `0` disables
    /// interval-based trimming (shutdown still drains the cache).
    pub cache_trim_interval: u64,
    pub leak_detection_level: LeakDetectionLevel,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            arena_count: 2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            page_size: 8 * 1024,
            max_order: 11, // 8 KiB << 11 == 16 MiB chunks, matching the reference allocator.
            small_cache_size: 256,
            normal_cache_size: 64,
            cache_trim_interval: 8_192,
            leak_detection_level: LeakDetectionLevel::Simple,
        }
    }
}

const SMALL_SIZE_CLASSES: &[usize] = &[16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

fn depth_of(node_id: u32) -> u32 {
    31 - node_id.leading_zeros()
}

/// depth such that `(page_size << max_order) >> depth >= bytes`, or `None`
/// if even a whole chunk can't satisfy the request.
fn depth_for_size(page_size: usize, max_order: u32, bytes: usize) -> Option<u32> {
    let mut depth = max_order;
    let mut run = page_size;
    while run < bytes {
        if depth == 0 {
            return None;
        }
        depth -= 1;
        run <<= 1;
    }
    Some(depth)
}

struct Subpage {
    elem_size: usize,
    num_slots: u16,
    bitmap: Vec<u64>,
    free_count: u16,
}

impl Subpage {
    fn new(elem_size: usize, page_size: usize) -> Self {
        let num_slots = (page_size / elem_size) as u16;
        let words = (num_slots as usize).div_ceil(64);
        Subpage {
            elem_size,
            num_slots,
            bitmap: vec![0u64; words],
            free_count: num_slots,
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = word.trailing_ones();
                let slot = word_idx as u16 * 64 + bit as u16;
                if slot >= self.num_slots {
                    return None;
                }
                *word |= 1 << bit;
                self.free_count -= 1;
                return Some(slot);
            }
        }
        None
    }

    /// Returns `true` if this call frees the last used slot.
    fn free(&mut self, slot: u16) -> bool {
        let word = (slot / 64) as usize;
        let bit = slot % 64;
        self.bitmap[word] &= !(1 << bit);
        self.free_count += 1;
        self.free_count == self.num_slots
    }

    fn was_full(&self) -> bool {
        self.free_count == 0
    }
}

struct Chunk {
    id: u64,
    memory: Arc<Mutex<Vec<u8>>>,
    page_size: usize,
    max_order: u32,
    memory_map: Mutex<Vec<u8>>,
    subpages: Mutex<HashMap<u32, Subpage>>,
}

impl Chunk {
    fn new(id: u64, page_size: usize, max_order: u32) -> Self {
        let chunk_size = page_size << max_order;
        let num_nodes = 1usize << (max_order + 1);
        let mut memory_map = vec![0u8; num_nodes];
        for (node_id, slot) in memory_map.iter_mut().enumerate().skip(1) {
            *slot = depth_of(node_id as u32) as u8;
        }
        Chunk {
            id,
            memory: Arc::new(Mutex::new(vec![0u8; chunk_size])),
            page_size,
            max_order,
            memory_map: Mutex::new(memory_map),
            subpages: Mutex::new(HashMap::new()),
        }
    }

    fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    fn offset_of(&self, node_id: u32) -> usize {
        let d = depth_of(node_id);
        let size_at_depth = self.chunk_size() >> d;
        (node_id as usize - (1usize << d)) * size_at_depth
    }

    /// Finds and marks allocated the shallowest free node at `target_depth`.
    fn alloc_node(&self, target_depth: u32) -> Option<u32> {
        let mut mm = self.memory_map.lock().unwrap();
        if mm[1] as u32 > target_depth {
            return None;
        }
        let mut id = 1u32;
        for _ in 0..target_depth {
            let left = id * 2;
            id = if (mm[left as usize] as u32) <= target_depth {
                left
            } else {
                left + 1
            };
        }
        mm[id as usize] = self.max_order as u8 + 1;
        self.propagate_up(&mut mm, id);
        Some(id)
    }

    fn free_node(&self, node_id: u32) {
        let mut mm = self.memory_map.lock().unwrap();
        mm[node_id as usize] = depth_of(node_id) as u8;
        self.propagate_up(&mut mm, node_id);
    }

    fn propagate_up(&self, mm: &mut [u8], mut id: u32) {
        while id > 1 {
            id /= 2;
            mm[id as usize] = mm[(id * 2) as usize].min(mm[(id * 2 + 1) as usize]);
        }
    }
}

/// One independent lock domain: a set of chunks plus the free-subpage lists
/// for each small size class.
pub(crate) struct Arena {
    id: u64,
    /// Which `PooledByteBufAllocator` this arena belongs to — distinct from
    /// `id`, which is only this arena's index within that pool. Scopes the
    /// thread-local arena pick and cache so two pools sharing a thread never
    /// see each other's state.
    pool_id: u64,
    page_size: usize,
    max_order: u32,
    small_cache_size: usize,
    normal_cache_size: usize,
    cache_trim_interval: u64,
    chunks: Mutex<HashMap<u64, Arc<Chunk>>>,
    next_chunk_id: AtomicU64,
    subpage_free_lists: Mutex<HashMap<usize, VecDeque<(Arc<Chunk>, u32)>>>,
    pub(crate) leak_detector: LeakDetector,
    pub(crate) bytes_in_use: AtomicUsize,
    /// Lets `reallocate` (which only gets `&self` through the `ArenaReturn`
    /// trait object) hand out a fresh `Arc<Arena>` for the new allocation's
    /// release hook, without every caller threading the `Arc` through.
    self_ref: Weak<Arena>,
}

impl Arena {
    fn new(id: u64, pool_id: u64, config: &PoolConfig, self_ref: Weak<Arena>) -> Self {
        Arena {
            id,
            pool_id,
            page_size: config.page_size,
            max_order: config.max_order,
            small_cache_size: config.small_cache_size,
            normal_cache_size: config.normal_cache_size,
            cache_trim_interval: config.cache_trim_interval,
            chunks: Mutex::new(HashMap::new()),
            next_chunk_id: AtomicU64::new(1),
            subpage_free_lists: Mutex::new(HashMap::new()),
            leak_detector: LeakDetector::new(config.leak_detection_level),
            bytes_in_use: AtomicUsize::new(0),
            self_ref,
        }
    }

    fn chunk_size(&self) -> usize {
        self.page_size << self.max_order
    }

    fn size_class_for(&self, bytes: usize) -> Option<usize> {
        SMALL_SIZE_CLASSES
            .iter()
            .copied()
            .find(|&class| class >= bytes)
    }

    fn allocate_region(self: &Arc<Self>, requested: usize) -> BufResult<PoolAllocation> {
        if requested >= self.page_size {
            return self.allocate_normal(requested);
        }
        match self.size_class_for(requested) {
            Some(elem_size) if elem_size < self.page_size => self.allocate_subpage(elem_size),
            _ => self.allocate_normal(requested),
        }
    }

    fn allocate_normal(self: &Arc<Self>, requested: usize) -> BufResult<PoolAllocation> {
        if requested > self.chunk_size() {
            return Err(BufError::OutOfMemory { requested });
        }
        let depth = depth_for_size(self.page_size, self.max_order, requested)
            .ok_or(BufError::OutOfMemory { requested })?;
        let run_size = self.chunk_size() >> depth;

        if let Some(cached) = cache::take(self.pool_id, false, run_size) {
            return Ok(self.pool_allocation_from_cache(cached));
        }

        let chunks = self.chunks.lock().unwrap();
        for chunk in chunks.values() {
            if let Some(node_id) = chunk.alloc_node(depth) {
                let offset = chunk.offset_of(node_id);
                self.bytes_in_use.fetch_add(run_size, Ordering::Relaxed);
                return Ok(PoolAllocation {
                    memory: Arc::clone(&chunk.memory),
                    base: offset,
                    physical_len: run_size,
                    chunk_id: chunk.id,
                    kind: PoolAllocKind::Normal { node_id },
                    arena: Arc::clone(self) as Arc<dyn ArenaReturn>,
                });
            }
        }
        drop(chunks);

        let chunk = self.new_chunk();
        let node_id = chunk
            .alloc_node(depth)
            .expect("fresh chunk always has room for its own depth");
        let offset = chunk.offset_of(node_id);
        self.bytes_in_use.fetch_add(run_size, Ordering::Relaxed);
        Ok(PoolAllocation {
            memory: Arc::clone(&chunk.memory),
            base: offset,
            physical_len: run_size,
            chunk_id: chunk.id,
            kind: PoolAllocKind::Normal { node_id },
            arena: Arc::clone(self) as Arc<dyn ArenaReturn>,
        })
    }

    fn allocate_subpage(self: &Arc<Self>, elem_size: usize) -> BufResult<PoolAllocation> {
        if let Some(cached) = cache::take(self.pool_id, true, elem_size) {
            return Ok(self.pool_allocation_from_cache(cached));
        }

        let mut free_lists = self.subpage_free_lists.lock().unwrap();
        let list = free_lists.entry(elem_size).or_default();
        while let Some((chunk, leaf_id)) = list.pop_front() {
            let mut subpages = chunk.subpages.lock().unwrap();
            if let Some(subpage) = subpages.get_mut(&leaf_id) {
                if let Some(slot) = subpage.allocate() {
                    if subpage.free_count > 0 {
                        list.push_back((Arc::clone(&chunk), leaf_id));
                    }
                    let page_node = (1u32 << self.max_order) + leaf_id;
                    let offset = chunk.offset_of(page_node) + slot as usize * elem_size;
                    self.bytes_in_use.fetch_add(elem_size, Ordering::Relaxed);
                    return Ok(PoolAllocation {
                        memory: Arc::clone(&chunk.memory),
                        base: offset,
                        physical_len: elem_size,
                        chunk_id: chunk.id,
                        kind: PoolAllocKind::Subpage {
                            leaf_id,
                            slot,
                            elem_size,
                        },
                        arena: Arc::clone(self) as Arc<dyn ArenaReturn>,
                    });
                }
            }
        }
        drop(free_lists);

        // No subpage with room; carve a fresh page out of some chunk.
        let chunks = self.chunks.lock().unwrap();
        let mut found = None;
        for chunk in chunks.values() {
            if let Some(node_id) = chunk.alloc_node(self.max_order) {
                found = Some((Arc::clone(chunk), node_id));
                break;
            }
        }
        drop(chunks);
        let (chunk, page_node) = match found {
            Some(v) => v,
            None => {
                let chunk = self.new_chunk();
                let node_id = chunk
                    .alloc_node(self.max_order)
                    .expect("fresh chunk always has a free leaf page");
                (chunk, node_id)
            }
        };
        let leaf_id = page_node - (1u32 << self.max_order);
        let mut subpage = Subpage::new(elem_size, self.page_size);
        let slot = subpage.allocate().expect("new subpage has free slots");
        let has_more = subpage.free_count > 0;
        chunk.subpages.lock().unwrap().insert(leaf_id, subpage);
        if has_more {
            self.subpage_free_lists
                .lock()
                .unwrap()
                .entry(elem_size)
                .or_default()
                .push_back((Arc::clone(&chunk), leaf_id));
        }
        let offset = chunk.offset_of(page_node) + slot as usize * elem_size;
        self.bytes_in_use.fetch_add(elem_size, Ordering::Relaxed);
        Ok(PoolAllocation {
            memory: Arc::clone(&chunk.memory),
            base: offset,
            physical_len: elem_size,
            chunk_id: chunk.id,
            kind: PoolAllocKind::Subpage {
                leaf_id,
                slot,
                elem_size,
            },
            arena: Arc::clone(self) as Arc<dyn ArenaReturn>,
        })
    }

    fn pool_allocation_from_cache(self: &Arc<Self>, cached: cache::CachedEntry) -> PoolAllocation {
        PoolAllocation {
            memory: cached.memory,
            base: cached.base,
            physical_len: cached.physical_len,
            chunk_id: cached.chunk_id,
            kind: cached.kind,
            arena: Arc::clone(self) as Arc<dyn ArenaReturn>,
        }
    }

    fn new_chunk(&self) -> Arc<Chunk> {
        let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
        let chunk = Arc::new(Chunk::new(id, self.page_size, self.max_order));
        self.chunks.lock().unwrap().insert(id, Arc::clone(&chunk));
        chunk
    }

    fn lookup_chunk(&self, chunk_id: u64) -> Option<Arc<Chunk>> {
        self.chunks.lock().unwrap().get(&chunk_id).cloned()
    }

    /// Unconditionally returns everything this thread has cached to the
    /// chunk/subpage bookkeeping. Called by the executor during shutdown.
    pub(crate) fn trim_thread_cache(&self) {
        cache::drain_all(self.pool_id, |entry| self.return_cached_entry(entry));
    }

    /// Returns an entry straight to the chunk/subpage bookkeeping,
    /// bypassing the thread-local cache. Used from inside a cache drain,
    /// where the cache's `RefCell` is already borrowed on this thread and
    /// routing back through `cache::put` would double-borrow it.
    fn return_cached_entry(&self, entry: cache::CachedEntry) {
        match entry.kind {
            PoolAllocKind::Normal { node_id } => self.free_normal_direct(entry.chunk_id, node_id),
            PoolAllocKind::Subpage {
                leaf_id,
                slot,
                elem_size,
            } => self.free_subpage_direct(entry.chunk_id, leaf_id, slot, elem_size),
        }
    }

    fn free_normal_direct(&self, chunk_id: u64, node_id: u32) {
        if let Some(chunk) = self.lookup_chunk(chunk_id) {
            chunk.free_node(node_id);
        }
    }

    fn free_subpage_direct(&self, chunk_id: u64, leaf_id: u32, slot: u16, elem_size: usize) {
        if let Some(chunk) = self.lookup_chunk(chunk_id) {
            self.free_subpage_now(&chunk, leaf_id, slot, elem_size);
        }
    }
}

impl ArenaReturn for Arena {
    fn free_normal(&self, region_id: u64, chunk_id: u64, node_id: u32) {
        self.leak_detector.confirm_released(region_id);
        let Some(chunk) = self.lookup_chunk(chunk_id) else {
            return;
        };
        let run_size = chunk.chunk_size() >> depth_of(node_id);
        self.bytes_in_use.fetch_sub(run_size, Ordering::Relaxed);
        let entry = cache::CachedEntry {
            memory: Arc::clone(&chunk.memory),
            base: chunk.offset_of(node_id),
            physical_len: run_size,
            chunk_id,
            kind: PoolAllocKind::Normal { node_id },
        };
        if let Some(rejected) = cache::put(self.pool_id, false, run_size, entry, self.normal_cache_size) {
            if let PoolAllocKind::Normal { node_id } = rejected.kind {
                chunk.free_node(node_id);
            }
        }
    }

    fn free_subpage(&self, region_id: u64, chunk_id: u64, leaf_id: u32, slot: u16, elem_size: usize) {
        self.leak_detector.confirm_released(region_id);
        let Some(chunk) = self.lookup_chunk(chunk_id) else {
            return;
        };
        self.bytes_in_use.fetch_sub(elem_size, Ordering::Relaxed);
        let page_node = (1u32 << self.max_order) + leaf_id;
        let base = chunk.offset_of(page_node) + slot as usize * elem_size;
        let entry = cache::CachedEntry {
            memory: Arc::clone(&chunk.memory),
            base,
            physical_len: elem_size,
            chunk_id,
            kind: PoolAllocKind::Subpage {
                leaf_id,
                slot,
                elem_size,
            },
        };
        if cache::put(self.pool_id, true, elem_size, entry, self.small_cache_size).is_none() {
            return;
        }
        // Cache rejected it (full); actually free the slot now.
        self.free_subpage_now(&chunk, leaf_id, slot, elem_size);
    }

    fn reallocate(&self, requested: usize) -> BufResult<PoolAllocation> {
        let this = self
            .self_ref
            .upgrade()
            .expect("arena outlives every allocation it hands out");
        this.allocate_region(requested)
    }

    fn note_leak_suspect(&self, region_id: u64, held: usize) {
        self.leak_detector.note_suspect(region_id, held);
    }
}

impl Arena {
    fn free_subpage_now(&self, chunk: &Arc<Chunk>, leaf_id: u32, slot: u16, elem_size: usize) {
        let mut subpages = chunk.subpages.lock().unwrap();
        let fully_free = match subpages.get_mut(&leaf_id) {
            Some(subpage) => subpage.free(slot),
            None => return,
        };
        if fully_free {
            subpages.remove(&leaf_id);
            drop(subpages);
            let mut free_lists = self.subpage_free_lists.lock().unwrap();
            if let Some(list) = free_lists.get_mut(&elem_size) {
                list.retain(|(_, id)| *id != leaf_id);
            }
            drop(free_lists);
            let page_node = (1u32 << self.max_order) + leaf_id;
            chunk.free_node(page_node);
        } else {
            let was_full = {
                let subpage = subpages.get(&leaf_id).unwrap();
                subpage.was_full()
            };
            drop(subpages);
            if was_full {
                self.subpage_free_lists
                    .lock()
                    .unwrap()
                    .entry(elem_size)
                    .or_default()
                    .push_back((Arc::clone(chunk), leaf_id));
            }
        }
    }
}

/// The pooled allocator described throughout §4.1: `arena_count`
/// independent arenas, each thread pinned to one on first use.
pub struct PooledByteBufAllocator {
    arenas: Vec<Arc<Arena>>,
    next_arena: AtomicUsize,
    cache_trim_interval: u64,
    /// Identifies this pool among others sharing a process, so per-thread
    /// arena pinning and caching never cross between independent pools.
    pool_id: u64,
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ARENA: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

impl PooledByteBufAllocator {
    pub fn new(config: PoolConfig) -> Self {
        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let arenas = (0..config.arena_count.max(1))
            .map(|i| Arc::new_cyclic(|weak| Arena::new(i as u64, pool_id, &config, weak.clone())))
            .collect();
        PooledByteBufAllocator {
            arenas,
            next_arena: AtomicUsize::new(0),
            cache_trim_interval: config.cache_trim_interval,
            pool_id,
        }
    }

    fn pick_arena(&self) -> Arc<Arena> {
        let idx = THREAD_ARENA.with(|map| {
            let mut map = map.borrow_mut();
            *map.entry(self.pool_id)
                .or_insert_with(|| self.next_arena.fetch_add(1, Ordering::Relaxed) % self.arenas.len())
        });
        Arc::clone(&self.arenas[idx])
    }

    /// Total bytes currently checked out across all arenas (live
    /// allocations plus anything sitting in a thread-local cache).
    pub fn bytes_in_use(&self) -> usize {
        self.arenas
            .iter()
            .map(|a| a.bytes_in_use.load(Ordering::Relaxed))
            .sum()
    }

    /// Drains the calling thread's cache back into its arena's
    /// bookkeeping. The executor calls this during shutdown (§4.1 state
    /// machine: `shutting-down` drains caches back to the central pool).
    pub fn trim_current_thread_cache(&self) {
        for arena in &self.arenas {
            arena.trim_thread_cache();
        }
    }

    pub fn leak_report(&self) -> Vec<String> {
        self.arenas
            .iter()
            .flat_map(|a| a.leak_detector.drain_reports())
            .collect()
    }
}

impl ByteBufAllocator for PooledByteBufAllocator {
    fn allocate(&self, initial: usize, max_capacity: usize) -> BufResult<ByteBuf> {
        if initial > max_capacity {
            return Err(BufError::InitialExceedsMax {
                initial,
                max: max_capacity,
            });
        }
        let arena = self.pick_arena();
        cache::note_allocation(arena.pool_id, self.cache_trim_interval, |entry| {
            arena.return_cached_entry(entry)
        });
        if initial > arena.chunk_size() {
            // Huge allocation: bypass the pool entirely (spec §4.1).
            return ByteBuf::new_heap(initial, max_capacity);
        }
        let region = arena.allocate_region(initial)?;
        let buf = ByteBuf::from_pool(region, initial, max_capacity);
        arena.leak_detector.track(&buf);
        Ok(buf)
    }

    fn allocate_direct(&self, initial: usize, max_capacity: usize) -> BufResult<ByteBuf> {
        self.allocate(initial, max_capacity)
    }
}
