//! Byte containers with a dual-cursor, reference-counted lifecycle, and the
//! slab/page/subpage pooled allocator that backs them.
//!
//! [`ByteBuf`] is the workhorse type: a linear octet region with independent
//! reader/writer cursors (§3 of the design) and an atomically maintained
//! reference count. [`ByteBufAllocator`] is the seam a channel's
//! configuration names (§6.3); [`PooledByteBufAllocator`] is the pool
//! described in "Pool algorithm", [`UnpooledByteBufAllocator`] the plain
//! heap fallback.

mod allocator;
mod bytebuf;
mod composite;
mod leak;
mod pool;
mod pool_thread_cache;

pub use allocator::{ByteBufAllocator, UnpooledByteBufAllocator};
pub use bytebuf::ByteBuf;
pub use composite::CompositeByteBuf;
pub use leak::{LeakDetectionLevel, LeakDetector};
pub use pool::{PoolConfig, PooledByteBufAllocator};

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Errors raised by the buffer subsystem (spec §7 kinds 2 and 3).
#[derive(Debug, Error)]
pub enum BufError {
    #[error("buffer {id} accessed after release")]
    UseAfterRelease { id: u64 },

    #[error("buffer {id} released too many times (held {held}, requested {requested})")]
    OverRelease { id: u64, held: usize, requested: usize },

    #[error("requested initial capacity {initial} exceeds max capacity {max}")]
    InitialExceedsMax { initial: usize, max: usize },

    #[error("requested capacity {requested} exceeds max capacity {max}")]
    CapacityExceedsMax { requested: usize, max: usize },

    #[error("allocator is out of memory for a request of {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("index {index} out of bounds for buffer of capacity {capacity}")]
    IndexOutOfBounds { index: usize, capacity: usize },
}

pub(crate) type BufResult<T> = Result<T, BufError>;

/// Source of the monotonically increasing ids used to identify buffers for
/// debugging and leak reporting. Not part of any ordering guarantee.
pub(crate) fn next_buf_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
