//! A `ByteBuf`-like view over a sequence of buffers, read and written as if
//! they were one contiguous region without copying their contents together.
//!
//! Used by handlers that accumulate scattered writes (e.g. a gathering
//! write from several pipeline stages) and want a single cursor over all of
//! them, and by decoders that want to hand a caller a zero-copy view
//! spanning more than one physical allocation.

use super::{BufError, BufResult, ByteBuf};

struct Component {
    buf: ByteBuf,
    /// Offset of this component's first byte in the composite's address
    /// space.
    offset: usize,
}

/// Logically contiguous view over its component buffers. Each component is
/// retained for as long as it's part of the composite; dropping (or
/// `release`-ing) the composite releases every component in turn.
pub struct CompositeByteBuf {
    components: Vec<Component>,
    reader_index: usize,
    writer_index: usize,
    capacity: usize,
}

impl CompositeByteBuf {
    pub fn new() -> Self {
        CompositeByteBuf {
            components: Vec::new(),
            reader_index: 0,
            writer_index: 0,
            capacity: 0,
        }
    }

    /// Appends `buf` as a new component, extending the composite's
    /// capacity and writer index by `buf.readable_bytes()`. The component's
    /// own reader/writer indices are not consulted again; only its
    /// readable span at the moment of adding becomes part of the
    /// composite's addressable range.
    pub fn add_component(&mut self, buf: ByteBuf) {
        let len = buf.readable_bytes();
        let offset = self.capacity;
        self.components.push(Component { buf, offset });
        self.capacity += len;
        self.writer_index += len;
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reader_index(&self) -> usize {
        self.reader_index
    }

    pub fn writer_index(&self) -> usize {
        self.writer_index
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn is_readable(&self) -> bool {
        self.readable_bytes() > 0
    }

    /// Locates the component covering absolute index `index`, and the
    /// offset within that component.
    fn locate(&self, index: usize) -> BufResult<(usize, usize)> {
        for (i, c) in self.components.iter().enumerate() {
            let comp_len = c.buf.readable_bytes();
            if index < c.offset + comp_len {
                return Ok((i, index - c.offset));
            }
        }
        Err(BufError::IndexOutOfBounds {
            index,
            capacity: self.capacity,
        })
    }

    /// Copies `len` bytes starting at absolute `index`, crossing component
    /// boundaries as needed.
    pub fn get_bytes(&self, index: usize, len: usize) -> BufResult<Vec<u8>> {
        if index + len > self.capacity {
            return Err(BufError::IndexOutOfBounds {
                index,
                capacity: self.capacity,
            });
        }
        let mut out = Vec::with_capacity(len);
        let mut remaining = len;
        let mut cursor = index;
        while remaining > 0 {
            let (comp_idx, local_offset) = self.locate(cursor)?;
            let comp = &self.components[comp_idx];
            let comp_len = comp.buf.readable_bytes();
            let take = remaining.min(comp_len - local_offset);
            out.extend_from_slice(&comp.buf.get_bytes(local_offset, take)?);
            remaining -= take;
            cursor += take;
        }
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> BufResult<Vec<u8>> {
        if self.reader_index + len > self.writer_index {
            return Err(BufError::IndexOutOfBounds {
                index: self.reader_index,
                capacity: self.writer_index,
            });
        }
        let out = self.get_bytes(self.reader_index, len)?;
        self.reader_index += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> BufResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// First index (relative to the start of the composite, not the reader
    /// index) of `pattern` within the readable range, or `-1` if absent.
    /// Checks every candidate start position, so a match straddling a
    /// component boundary is found the same as one sitting inside a single
    /// component.
    pub fn search(&self, pattern: &[u8]) -> BufResult<isize> {
        if pattern.is_empty() {
            return Ok(self.reader_index as isize);
        }
        if pattern.len() > self.readable_bytes() {
            return Ok(-1);
        }
        for start in self.reader_index..=(self.writer_index - pattern.len()) {
            if self.get_bytes(start, pattern.len())? == pattern {
                return Ok(start as isize);
            }
        }
        Ok(-1)
    }

    /// Releases every component buffer once. Errors from an individual
    /// component's release are collected; the first one encountered is
    /// returned, but every component is still given the chance to release.
    pub fn release(&mut self) -> BufResult<()> {
        let mut first_err = None;
        for c in &self.components {
            if let Err(e) = c.buf.release(1) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for CompositeByteBuf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::ByteBufAllocator;
    use crate::buf::UnpooledByteBufAllocator;

    fn component(bytes: &[u8]) -> ByteBuf {
        let alloc = UnpooledByteBufAllocator::new();
        let mut buf = alloc.allocate(bytes.len(), bytes.len()).unwrap();
        buf.write_bytes(bytes).unwrap();
        buf
    }

    #[test]
    fn search_finds_pattern_straddling_a_component_boundary() {
        let mut composite = CompositeByteBuf::new();
        composite.add_component(component(b"hello wo"));
        composite.add_component(component(b"rld"));

        assert_eq!(composite.search(b"world").unwrap(), 6);
        assert_eq!(composite.search(b"wo").unwrap(), 6);
        assert_eq!(composite.search(b"nope").unwrap(), -1);
        assert_eq!(composite.search(b"").unwrap(), 0);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn search_matches_flattened_windows_search(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..6), 1..6),
            pattern in prop::collection::vec(any::<u8>(), 1..4),
        ) {
            let mut composite = CompositeByteBuf::new();
            let mut flat = Vec::new();
            for chunk in &chunks {
                flat.extend_from_slice(chunk);
                composite.add_component(component(chunk));
            }

            let expected = flat
                .windows(pattern.len())
                .position(|w| w == pattern.as_slice())
                .map(|i| i as isize)
                .unwrap_or(-1);

            prop_assert_eq!(composite.search(&pattern).unwrap(), expected);
        }
    }
}
