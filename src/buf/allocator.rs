use super::{ByteBuf, BufError, BufResult};

/// Source of [`ByteBuf`]s. A channel's configuration names one of these
/// (spec §3); handlers allocate outbound buffers through it rather than
/// constructing `ByteBuf`s directly, so a pooled configuration benefits
/// every handler in the pipeline without code changes.
pub trait ByteBufAllocator: Send + Sync {
    /// Allocates heap-backed storage. Always available, never fails for
    /// lack of a pool slot — only for a request that violates the
    /// initial/max relationship or genuinely exhausts memory.
    fn allocate(&self, initial: usize, max_capacity: usize) -> BufResult<ByteBuf>;

    /// Allocates storage the allocator prefers for I/O-bound producers
    /// (e.g. pooled, to avoid a malloc/free per read). Unpooled allocators
    /// simply delegate to [`allocate`](Self::allocate).
    fn allocate_direct(&self, initial: usize, max_capacity: usize) -> BufResult<ByteBuf> {
        self.allocate(initial, max_capacity)
    }
}

/// Allocates a fresh `Vec<u8>` per call. The simple, always-correct
/// fallback; every pooled allocation path in this crate can be replaced by
/// this type without changing caller code.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnpooledByteBufAllocator;

impl UnpooledByteBufAllocator {
    pub fn new() -> Self {
        UnpooledByteBufAllocator
    }
}

impl ByteBufAllocator for UnpooledByteBufAllocator {
    fn allocate(&self, initial: usize, max_capacity: usize) -> BufResult<ByteBuf> {
        if initial > max_capacity {
            return Err(BufError::InitialExceedsMax {
                initial,
                max: max_capacity,
            });
        }
        ByteBuf::new_heap(initial, max_capacity)
    }
}
