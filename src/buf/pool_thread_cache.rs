//! Per-executor thread-local cache of recently released pool regions.
//!
//! A release that lands in the cache skips the arena's chunk/subpage
//! bookkeeping (and its lock) entirely; a later allocate of the same size
//! class on the same thread is satisfied straight out of the cache. Entries
//! only flow back to the arena on an explicit trim (interval-based, or at
//! executor shutdown).

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::bytebuf::PoolAllocKind;

pub(crate) struct CachedEntry {
    pub memory: Arc<Mutex<Vec<u8>>>,
    pub base: usize,
    pub physical_len: usize,
    pub chunk_id: u64,
    pub kind: PoolAllocKind,
}

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
enum CacheKey {
    Normal(usize),
    Subpage(usize),
}

#[derive(Default)]
struct ThreadCache {
    entries: HashMap<CacheKey, VecDeque<CachedEntry>>,
    allocations_since_trim: u64,
}

thread_local! {
    /// Keyed by the owning pool's `pool_id`, so two `PooledByteBufAllocator`
    /// instances sharing a thread never see each other's cached entries.
    static CACHE: RefCell<HashMap<u64, ThreadCache>> = RefCell::new(HashMap::new());
}

fn key_for(is_subpage: bool, size: usize) -> CacheKey {
    if is_subpage {
        CacheKey::Subpage(size)
    } else {
        CacheKey::Normal(size)
    }
}

/// Pops a cached region of the given size class for this thread, if any.
pub(crate) fn take(pool_id: u64, is_subpage: bool, size: usize) -> Option<CachedEntry> {
    CACHE.with(|c| {
        c.borrow_mut()
            .get_mut(&pool_id)
            .and_then(|cache| cache.entries.get_mut(&key_for(is_subpage, size)))
            .and_then(VecDeque::pop_front)
    })
}

/// Stashes a released region for reuse. Returns it back to the caller
/// (unchanged) if the class is already at `capacity`, so the caller can
/// free it through the arena instead.
pub(crate) fn put(
    pool_id: u64,
    is_subpage: bool,
    size: usize,
    entry: CachedEntry,
    capacity: usize,
) -> Option<CachedEntry> {
    CACHE.with(|c| {
        let mut map = c.borrow_mut();
        let cache = map.entry(pool_id).or_default();
        let list = cache.entries.entry(key_for(is_subpage, size)).or_default();
        if list.len() >= capacity {
            Some(entry)
        } else {
            list.push_back(entry);
            None
        }
    })
}

/// Call once per allocation; runs `on_trim` for every cached entry once
/// `trim_interval` allocations have elapsed since the last trim.
pub(crate) fn note_allocation(pool_id: u64, trim_interval: u64, on_trim: impl FnMut(CachedEntry)) {
    if trim_interval == 0 {
        return;
    }
    CACHE.with(|c| {
        let mut map = c.borrow_mut();
        let cache = map.entry(pool_id).or_default();
        cache.allocations_since_trim += 1;
        if cache.allocations_since_trim >= trim_interval {
            cache.allocations_since_trim = 0;
            drain(cache, on_trim);
        }
    });
}

/// Unconditionally drains this thread's cache for one pool, e.g. on
/// executor shutdown.
pub(crate) fn drain_all(pool_id: u64, on_trim: impl FnMut(CachedEntry)) {
    CACHE.with(|c| {
        if let Some(cache) = c.borrow_mut().get_mut(&pool_id) {
            drain(cache, on_trim);
        }
    });
}

fn drain(cache: &mut ThreadCache, mut on_trim: impl FnMut(CachedEntry)) {
    for (_, mut list) in cache.entries.drain() {
        while let Some(entry) = list.pop_front() {
            on_trim(entry);
        }
    }
}
