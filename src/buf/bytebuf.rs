use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{next_buf_id, BufError, BufResult};

/// Backing kind of an allocation, used on release to route the region back
/// to whoever owns it (nothing, for heap; the arena, for pooled memory).
pub(crate) enum RegionKind {
    Heap,
    Pooled {
        arena: Arc<dyn ArenaReturn>,
        chunk_id: u64,
        alloc: PoolAllocKind,
    },
}

/// What a pooled region's slot looks like, so the arena knows how to free
/// (or reallocate) it without the buffer needing to know arena internals.
#[derive(Clone, Copy, Debug)]
pub(crate) enum PoolAllocKind {
    Normal { node_id: u32 },
    Subpage { leaf_id: u32, slot: u16, elem_size: usize },
}

/// What an arena exposes back to a pooled [`ByteBuf`] so it can release or
/// outgrow its region without borrowing the arena's internals directly.
pub(crate) trait ArenaReturn: Send + Sync {
    fn free_normal(&self, region_id: u64, chunk_id: u64, node_id: u32);
    fn free_subpage(&self, region_id: u64, chunk_id: u64, leaf_id: u32, slot: u16, elem_size: usize);
    /// Allocate a fresh region of at least `requested` bytes from this same
    /// arena, used when a pooled buffer outgrows the physical region its
    /// original allocation rounded to.
    fn reallocate(&self, requested: usize) -> BufResult<PoolAllocation>;
    /// A still-live region's last Rust reference is going away without ever
    /// having called `release()` down to zero — the leak detector's one real
    /// way of hearing about a forgotten release.
    fn note_leak_suspect(&self, region_id: u64, held: usize);
}

/// A freshly carved-out region: shared storage plus enough bookkeeping for
/// a [`ByteBuf`] to read/write/grow/release it.
pub(crate) struct PoolAllocation {
    pub memory: Arc<Mutex<Vec<u8>>>,
    pub base: usize,
    pub physical_len: usize,
    pub chunk_id: u64,
    pub kind: PoolAllocKind,
    pub arena: Arc<dyn ArenaReturn>,
}

/// The reference-counted cell shared by a root allocation and every
/// `slice`/`duplicate` view co-owning it. Only the count and the one-shot
/// release hook are contended; the bytes themselves are read/written
/// through `memory`, which is reached independently by each view.
struct AllocRegion {
    id: u64,
    refcnt: AtomicUsize,
    kind: Mutex<Option<RegionKind>>,
}

impl AllocRegion {
    fn new(kind: RegionKind) -> Self {
        AllocRegion {
            id: next_buf_id(),
            refcnt: AtomicUsize::new(1),
            kind: Mutex::new(Some(kind)),
        }
    }

    fn retain(&self, n: usize) -> BufResult<()> {
        loop {
            let cur = self.refcnt.load(Ordering::Acquire);
            if cur == 0 {
                return Err(BufError::UseAfterRelease { id: self.id });
            }
            let next = cur + n;
            if self
                .refcnt
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Returns `Ok(true)` iff this call brought the count to zero, in which
    /// case the release hook has already run.
    fn release(&self, n: usize) -> BufResult<bool> {
        loop {
            let cur = self.refcnt.load(Ordering::Acquire);
            if n > cur {
                return Err(BufError::OverRelease {
                    id: self.id,
                    held: cur,
                    requested: n,
                });
            }
            let next = cur - n;
            if self
                .refcnt
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if next == 0 {
                    self.deallocate();
                    return Ok(true);
                }
                return Ok(false);
            }
        }
    }

    fn is_live(&self) -> bool {
        self.refcnt.load(Ordering::Acquire) != 0
    }

    fn deallocate(&self) {
        let kind = self.kind.lock().unwrap().take();
        match kind {
            None | Some(RegionKind::Heap) => {}
            Some(RegionKind::Pooled {
                arena,
                chunk_id,
                alloc,
            }) => match alloc {
                PoolAllocKind::Normal { node_id } => arena.free_normal(self.id, chunk_id, node_id),
                PoolAllocKind::Subpage {
                    leaf_id,
                    slot,
                    elem_size,
                } => arena.free_subpage(self.id, chunk_id, leaf_id, slot, elem_size),
            },
        }
    }
}

/// A byte region with independent reader/writer cursors, a capacity that can
/// grow up to a fixed maximum, and an explicit, atomically maintained
/// reference count.
///
/// Cursor operations (`read_*`/`write_*`) advance `reader_index`/
/// `writer_index`; the indexed family (`get_*`/`set_*`) does not. Both
/// families bounds-check against the live capacity and refuse to touch a
/// buffer whose reference count has reached zero.
pub struct ByteBuf {
    id: u64,
    memory: Arc<Mutex<Vec<u8>>>,
    region: Arc<AllocRegion>,
    base: usize,
    physical_len: usize,
    reader_index: usize,
    writer_index: usize,
    capacity: usize,
    max_capacity: usize,
}

macro_rules! indexed_int {
    ($get:ident, $set:ident, $ty:ty, $n:expr, be) => {
        pub fn $get(&self, index: usize) -> BufResult<$ty> {
            let bytes = self.get_bytes(index, $n)?;
            let mut buf = [0u8; $n];
            buf.copy_from_slice(&bytes);
            Ok(<$ty>::from_be_bytes(buf))
        }

        pub fn $set(&mut self, index: usize, value: $ty) -> BufResult<()> {
            self.set_bytes(index, &value.to_be_bytes())
        }
    };
    ($get:ident, $set:ident, $ty:ty, $n:expr, le) => {
        pub fn $get(&self, index: usize) -> BufResult<$ty> {
            let bytes = self.get_bytes(index, $n)?;
            let mut buf = [0u8; $n];
            buf.copy_from_slice(&bytes);
            Ok(<$ty>::from_le_bytes(buf))
        }

        pub fn $set(&mut self, index: usize, value: $ty) -> BufResult<()> {
            self.set_bytes(index, &value.to_le_bytes())
        }
    };
}

macro_rules! cursor_int {
    ($read:ident, $write:ident, $get:ident, $set:ident, $ty:ty, $n:expr) => {
        pub fn $read(&mut self) -> BufResult<$ty> {
            self.check_readable($n)?;
            let v = self.$get(self.reader_index)?;
            self.reader_index += $n;
            Ok(v)
        }

        pub fn $write(&mut self, value: $ty) -> BufResult<()> {
            self.ensure_writable($n)?;
            self.$set(self.writer_index, value)?;
            self.writer_index += $n;
            Ok(())
        }
    };
}

impl ByteBuf {
    /// Builds a plain heap-backed buffer. This is the path
    /// [`UnpooledByteBufAllocator`](super::UnpooledByteBufAllocator) uses;
    /// pooled buffers are built by the arena via `from_pool`.
    pub(crate) fn new_heap(initial: usize, max_capacity: usize) -> BufResult<ByteBuf> {
        if initial > max_capacity {
            return Err(BufError::InitialExceedsMax {
                initial,
                max: max_capacity,
            });
        }
        Ok(ByteBuf {
            id: next_buf_id(),
            memory: Arc::new(Mutex::new(vec![0u8; initial])),
            region: Arc::new(AllocRegion::new(RegionKind::Heap)),
            base: 0,
            physical_len: initial,
            reader_index: 0,
            writer_index: 0,
            capacity: initial,
            max_capacity,
        })
    }

    pub(crate) fn from_pool(alloc: PoolAllocation, initial: usize, max_capacity: usize) -> ByteBuf {
        ByteBuf {
            id: next_buf_id(),
            memory: alloc.memory,
            region: Arc::new(AllocRegion::new(RegionKind::Pooled {
                arena: alloc.arena,
                chunk_id: alloc.chunk_id,
                alloc: alloc.kind,
            })),
            base: alloc.base,
            physical_len: alloc.physical_len,
            reader_index: 0,
            writer_index: 0,
            capacity: initial,
            max_capacity,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The identity shared by this buffer and every `duplicate`/`slice` view
    /// co-owning the same backing region, as opposed to `id()` which is
    /// unique per view. The leak detector tracks by this, not by `id()`.
    pub(crate) fn region_id(&self) -> u64 {
        self.region.id
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.capacity - self.writer_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Moves the reader index forward without reading, e.g. to skip a
    /// header already inspected via the indexed API.
    pub fn skip(&mut self, n: usize) -> BufResult<()> {
        self.check_readable(n)?;
        self.reader_index += n;
        Ok(())
    }

    pub fn set_reader_index(&mut self, index: usize) -> BufResult<()> {
        if index > self.writer_index {
            return Err(BufError::IndexOutOfBounds {
                index,
                capacity: self.writer_index,
            });
        }
        self.reader_index = index;
        Ok(())
    }

    pub fn set_writer_index(&mut self, index: usize) -> BufResult<()> {
        if index < self.reader_index || index > self.capacity {
            return Err(BufError::IndexOutOfBounds {
                index,
                capacity: self.capacity,
            });
        }
        self.writer_index = index;
        Ok(())
    }

    fn check_live(&self) -> BufResult<()> {
        if !self.region.is_live() {
            return Err(BufError::UseAfterRelease { id: self.id });
        }
        Ok(())
    }

    fn check_index(&self, index: usize, len: usize) -> BufResult<()> {
        self.check_live()?;
        if index.checked_add(len).map_or(true, |end| end > self.capacity) {
            return Err(BufError::IndexOutOfBounds {
                index,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn check_readable(&self, len: usize) -> BufResult<()> {
        self.check_live()?;
        if self.reader_index + len > self.writer_index {
            return Err(BufError::IndexOutOfBounds {
                index: self.reader_index,
                capacity: self.writer_index,
            });
        }
        Ok(())
    }

    indexed_int!(get_u16_be, set_u16_be, u16, 2, be);
    indexed_int!(get_u16_le, set_u16_le, u16, 2, le);
    indexed_int!(get_i16_be, set_i16_be, i16, 2, be);
    indexed_int!(get_i16_le, set_i16_le, i16, 2, le);
    indexed_int!(get_u32_be, set_u32_be, u32, 4, be);
    indexed_int!(get_u32_le, set_u32_le, u32, 4, le);
    indexed_int!(get_i32_be, set_i32_be, i32, 4, be);
    indexed_int!(get_i32_le, set_i32_le, i32, 4, le);
    indexed_int!(get_u64_be, set_u64_be, u64, 8, be);
    indexed_int!(get_u64_le, set_u64_le, u64, 8, le);
    indexed_int!(get_i64_be, set_i64_be, i64, 8, be);
    indexed_int!(get_i64_le, set_i64_le, i64, 8, le);

    // ---- indexed access (no cursor movement) ----

    pub fn get_u8(&self, index: usize) -> BufResult<u8> {
        self.check_index(index, 1)?;
        Ok(self.memory.lock().unwrap()[self.base + index])
    }

    pub fn set_u8(&mut self, index: usize, value: u8) -> BufResult<()> {
        self.check_index(index, 1)?;
        self.memory.lock().unwrap()[self.base + index] = value;
        Ok(())
    }

    pub fn get_bytes(&self, index: usize, len: usize) -> BufResult<Vec<u8>> {
        self.check_index(index, len)?;
        let mem = self.memory.lock().unwrap();
        Ok(mem[self.base + index..self.base + index + len].to_vec())
    }

    pub fn set_bytes(&mut self, index: usize, src: &[u8]) -> BufResult<()> {
        self.check_index(index, src.len())?;
        let mut mem = self.memory.lock().unwrap();
        mem[self.base + index..self.base + index + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// 24-bit unsigned, big-endian; common in length-prefixed framing.
    pub fn get_u24_be(&self, index: usize) -> BufResult<u32> {
        let b = self.get_bytes(index, 3)?;
        Ok(((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32)
    }

    pub fn set_u24_be(&mut self, index: usize, value: u32) -> BufResult<()> {
        let b = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
        self.set_bytes(index, &b)
    }

    // ---- cursor access ----

    pub fn read_u8(&mut self) -> BufResult<u8> {
        self.check_readable(1)?;
        let v = self.get_u8(self.reader_index)?;
        self.reader_index += 1;
        Ok(v)
    }

    pub fn read_bytes(&mut self, len: usize) -> BufResult<Vec<u8>> {
        self.check_readable(len)?;
        let v = self.get_bytes(self.reader_index, len)?;
        self.reader_index += len;
        Ok(v)
    }

    cursor_int!(read_u16_be, write_u16_be, get_u16_be, set_u16_be, u16, 2);
    cursor_int!(read_u16_le, write_u16_le, get_u16_le, set_u16_le, u16, 2);
    cursor_int!(read_i16_be, write_i16_be, get_i16_be, set_i16_be, i16, 2);
    cursor_int!(read_u24_be, write_u24_be, get_u24_be, set_u24_be, u32, 3);
    cursor_int!(read_u32_be, write_u32_be, get_u32_be, set_u32_be, u32, 4);
    cursor_int!(read_u32_le, write_u32_le, get_u32_le, set_u32_le, u32, 4);
    cursor_int!(read_i32_be, write_i32_be, get_i32_be, set_i32_be, i32, 4);
    cursor_int!(read_u64_be, write_u64_be, get_u64_be, set_u64_be, u64, 8);
    cursor_int!(read_u64_le, write_u64_le, get_u64_le, set_u64_le, u64, 8);
    cursor_int!(read_i64_be, write_i64_be, get_i64_be, set_i64_be, i64, 8);

    pub fn write_u8(&mut self, value: u8) -> BufResult<()> {
        self.ensure_writable(1)?;
        self.set_u8(self.writer_index, value)?;
        self.writer_index += 1;
        Ok(())
    }

    pub fn write_bytes(&mut self, src: &[u8]) -> BufResult<()> {
        self.ensure_writable(src.len())?;
        self.set_bytes(self.writer_index, src)?;
        self.writer_index += src.len();
        Ok(())
    }

    /// LEB128-style varint, 7 payload bits per byte, MSB is the
    /// continuation flag. Used by handlers that need a compact length
    /// prefix without committing to a fixed width.
    pub fn read_varint_u32(&mut self) -> BufResult<u32> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7f) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 35 {
                return Err(BufError::IndexOutOfBounds {
                    index: self.reader_index,
                    capacity: self.capacity,
                });
            }
        }
    }

    pub fn write_varint_u32(&mut self, mut value: u32) -> BufResult<()> {
        loop {
            let mut byte = (value & 0x7f) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.write_u8(byte)?;
            if value == 0 {
                return Ok(());
            }
        }
    }

    /// First index (relative to the start of the buffer, not the reader
    /// index) of `pattern` within the readable range, or `-1` if absent.
    pub fn search(&self, pattern: &[u8]) -> BufResult<isize> {
        self.check_live()?;
        if pattern.is_empty() {
            return Ok(self.reader_index as isize);
        }
        let mem = self.memory.lock().unwrap();
        let hay = &mem[self.base + self.reader_index..self.base + self.writer_index];
        for start in 0..=hay.len().saturating_sub(pattern.len()) {
            if hay.len() >= pattern.len() && &hay[start..start + pattern.len()] == pattern {
                return Ok((self.reader_index + start) as isize);
            }
        }
        Ok(-1)
    }

    /// Shifts the unread bytes to the origin: `w -= r`, `r = 0`. A no-op
    /// when `r == 0`.
    pub fn compact(&mut self) -> BufResult<()> {
        self.check_live()?;
        if self.reader_index == 0 {
            return Ok(());
        }
        let readable = self.readable_bytes();
        let mut mem = self.memory.lock().unwrap();
        let (src_start, src_end) = (self.base + self.reader_index, self.base + self.writer_index);
        mem.copy_within(src_start..src_end, self.base);
        drop(mem);
        self.writer_index = readable;
        self.reader_index = 0;
        Ok(())
    }

    /// Grows or shrinks the visible capacity. Shrinking truncates both
    /// cursors to `min(cursor, new_cap)`. Growing beyond the capacity
    /// rounded up to by the allocator triggers a copy into a fresh, larger
    /// region (pooled buffers only; heap buffers resize their private
    /// storage in place).
    pub fn set_capacity(&mut self, new_cap: usize) -> BufResult<()> {
        self.check_live()?;
        if new_cap > self.max_capacity {
            return Err(BufError::CapacityExceedsMax {
                requested: new_cap,
                max: self.max_capacity,
            });
        }
        if new_cap <= self.physical_len {
            self.capacity = new_cap;
            self.reader_index = self.reader_index.min(new_cap);
            self.writer_index = self.writer_index.min(new_cap);
            return Ok(());
        }

        let is_pooled = matches!(*self.region.kind.lock().unwrap(), Some(RegionKind::Pooled { .. }));
        if !is_pooled {
            let mut mem = self.memory.lock().unwrap();
            mem.resize(self.base + new_cap, 0);
            drop(mem);
            self.physical_len = new_cap;
            self.capacity = new_cap;
            return Ok(());
        }

        let arena = match &*self.region.kind.lock().unwrap() {
            Some(RegionKind::Pooled { arena, .. }) => Arc::clone(arena),
            _ => unreachable!(),
        };
        let fresh = arena.reallocate(new_cap)?;
        {
            let old = self.memory.lock().unwrap();
            let mut new_mem = fresh.memory.lock().unwrap();
            let live = self.capacity;
            new_mem[fresh.base..fresh.base + live]
                .copy_from_slice(&old[self.base..self.base + live]);
        }
        let old_region = Arc::clone(&self.region);
        self.memory = fresh.memory;
        self.base = fresh.base;
        self.physical_len = fresh.physical_len;
        self.capacity = new_cap;
        self.region = Arc::new(AllocRegion::new(RegionKind::Pooled {
            arena,
            chunk_id: fresh.chunk_id,
            alloc: fresh.kind,
        }));
        old_region.release(1)?;
        Ok(())
    }

    fn ensure_writable(&mut self, additional: usize) -> BufResult<()> {
        let required = self.writer_index + additional;
        if required <= self.capacity {
            return Ok(());
        }
        let mut target = self.capacity.max(1);
        while target < required {
            target = (target * 2).min(self.max_capacity).max(required);
            if target >= self.max_capacity {
                target = self.max_capacity;
                break;
            }
        }
        if required > target {
            return Err(BufError::CapacityExceedsMax {
                requested: required,
                max: self.max_capacity,
            });
        }
        self.set_capacity(target)
    }

    /// Adds `n` to the reference count. Fails if the buffer has already
    /// reached zero (§3: post-release access fails).
    pub fn retain(&self, n: usize) -> BufResult<()> {
        self.region.retain(n)
    }

    /// Subtracts `n` from the reference count. Returns `true` iff this call
    /// brought the count to zero (and, for pooled buffers, returned the
    /// region to the arena or the calling thread's cache).
    pub fn release(&self, n: usize) -> BufResult<bool> {
        self.region.release(n)
    }

    pub fn ref_count(&self) -> usize {
        self.region.refcnt.load(Ordering::Acquire)
    }

    /// A view sharing storage and the reference count, with its own cursors
    /// initialized to this buffer's current reader/writer indices.
    pub fn duplicate(&self) -> BufResult<ByteBuf> {
        self.region.retain(1)?;
        Ok(ByteBuf {
            id: next_buf_id(),
            memory: Arc::clone(&self.memory),
            region: Arc::clone(&self.region),
            base: self.base,
            physical_len: self.physical_len,
            reader_index: self.reader_index,
            writer_index: self.writer_index,
            capacity: self.capacity,
            max_capacity: self.max_capacity,
        })
    }

    /// A fixed-capacity view over `[offset, offset+len)` of this buffer's
    /// readable-plus-written region, sharing storage and the reference
    /// count. Its own cursors start at `(0, len)`.
    pub fn slice(&self, offset: usize, len: usize) -> BufResult<ByteBuf> {
        self.check_index(offset, len)?;
        self.region.retain(1)?;
        Ok(ByteBuf {
            id: next_buf_id(),
            memory: Arc::clone(&self.memory),
            region: Arc::clone(&self.region),
            base: self.base + offset,
            physical_len: len,
            reader_index: 0,
            writer_index: len,
            capacity: len,
            max_capacity: len,
        })
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("id", &self.id)
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("capacity", &self.capacity)
            .field("max_capacity", &self.max_capacity)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

impl Drop for ByteBuf {
    /// If this is the last Rust reference to a region that's still live, the
    /// owner forgot to `release()` it down to zero — flag it for whichever
    /// arena owns the region. Heap-backed buffers have no arena to tell.
    fn drop(&mut self) {
        if Arc::strong_count(&self.region) != 1 || !self.region.is_live() {
            return;
        }
        let held = self.region.refcnt.load(Ordering::Acquire);
        if let Some(RegionKind::Pooled { arena, .. }) = &*self.region.kind.lock().unwrap() {
            arena.note_leak_suspect(self.region.id, held);
        }
    }
}
