//! The per-channel queue of pending writes and the water-mark-driven
//! writability flag (spec §3, §4.3, §8 scenario 4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::pipeline::Message;

use super::promise::ChannelPromise;
use super::ChannelError;

struct PendingWrite {
    msg: Message,
    size: usize,
    promise: ChannelPromise<ChannelError>,
}

/// A channel's outbound queue: pending messages awaiting `flush`, each
/// carrying a completion handle, plus the buffered-byte counter that
/// drives writability. Mutated only by the owning executor (spec §5).
pub struct ChannelOutboundBuffer {
    pending: VecDeque<PendingWrite>,
    buffered_bytes: AtomicUsize,
    writable: AtomicBool,
    low: usize,
    high: usize,
}

impl ChannelOutboundBuffer {
    pub fn new(low: usize, high: usize) -> Self {
        ChannelOutboundBuffer {
            pending: VecDeque::new(),
            buffered_bytes: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            low,
            high,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Queues `msg` (approximated in byte size by `size`) for the next
    /// `flush`. Returns `Some(edge)` if this write crossed a water mark,
    /// the event the caller should fire as `writability-changed`.
    pub fn queue_write(&mut self, msg: Message, size: usize, promise: ChannelPromise<ChannelError>) -> Option<bool> {
        self.pending.push_back(PendingWrite { msg, size, promise });
        let before = self.buffered_bytes.fetch_add(size, Ordering::AcqRel) + size;
        self.check_writability(before)
    }

    /// Hands every pending message to `send` in order, completing each
    /// write's promise and releasing its share of the byte counter as it
    /// goes. Returns `Some(edge)` if flushing crossed a water mark.
    pub fn flush(&mut self, mut send: impl FnMut(Message) -> Result<(), ChannelError>) -> Option<bool> {
        let mut edge = None;
        while let Some(PendingWrite { msg, size, promise }) = self.pending.pop_front() {
            let result = send(msg);
            let after = self.buffered_bytes.fetch_sub(size, Ordering::AcqRel) - size;
            if let Some(e) = self.check_writability(after) {
                edge = Some(e);
            }
            match result {
                Ok(()) => promise.succeed(),
                Err(e) => promise.fail(e),
            }
        }
        edge
    }

    /// Fails every still-pending write's promise without sending it, used
    /// when the channel is forced closed with writes still queued (spec §5
    /// "bounded drain window... fails any still-queued write promises").
    pub fn fail_all(&mut self, err: ChannelError) {
        while let Some(PendingWrite { promise, size, .. }) = self.pending.pop_front() {
            self.buffered_bytes.fetch_sub(size, Ordering::AcqRel);
            promise.fail(err.clone());
        }
        self.writable.store(true, Ordering::Release);
    }

    fn check_writability(&self, buffered: usize) -> Option<bool> {
        let was_writable = self.writable.load(Ordering::Acquire);
        if was_writable && buffered >= self.high {
            self.writable.store(false, Ordering::Release);
            Some(false)
        } else if !was_writable && buffered <= self.low {
            self.writable.store(true, Ordering::Release);
            Some(true)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn promise() -> ChannelPromise<ChannelError> {
        ChannelPromise::pending()
    }

    #[test]
    fn crossing_high_water_mark_reports_one_edge() {
        let mut buf = ChannelOutboundBuffer::new(32, 64);
        assert_eq!(buf.queue_write(Box::new(()), 40, promise()), None);
        assert!(buf.is_writable());
        assert_eq!(buf.queue_write(Box::new(()), 40, promise()), Some(false));
        assert!(!buf.is_writable());
        // Further writes while already unwritable don't re-surface the edge.
        assert_eq!(buf.queue_write(Box::new(()), 1, promise()), None);
    }

    #[test]
    fn flush_below_low_mark_restores_writability() {
        let mut buf = ChannelOutboundBuffer::new(32, 64);
        buf.queue_write(Box::new(()), 80, promise());
        assert!(!buf.is_writable());
        let edge = buf.flush(|_| Ok(()));
        assert_eq!(edge, Some(true));
        assert!(buf.is_writable());
        assert_eq!(buf.buffered_bytes(), 0);
    }
}
