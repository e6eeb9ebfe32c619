//! The scheduled-task heap, ordered `(deadline, insertion id)` ascending so
//! ties break deterministically in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::task::{BoxedJob, JobHandle};

/// How a scheduled task repeats, mirroring `schedule`/`scheduleAtFixedRate`/
/// `scheduleWithFixedDelay`.
#[derive(Clone, Copy)]
pub(crate) enum Repeat {
    Once,
    /// Re-fires every `period`, measured from the *previous deadline*
    /// (drift does not accumulate).
    FixedRate(Duration),
    /// Re-fires `delay` after the *previous run finishes*.
    FixedDelay(Duration),
}

/// A one-shot job already wraps its own completion bookkeeping (built via
/// `task::make_job`, so it's reusable as an ordinary `BoxedJob`). A
/// repeating job is a plain `FnMut` shared behind an `Arc<Mutex<_>>` so the
/// same closure can be invoked again after each re-schedule, which a
/// `FnOnce`-based `BoxedJob` can't do.
pub(crate) enum ScheduledJob {
    Once(BoxedJob),
    Repeating(Arc<Mutex<dyn FnMut() + Send>>),
}

pub(crate) struct ScheduledTask {
    pub deadline: Instant,
    pub seq: u64,
    pub repeat: Repeat,
    pub cancelled: Arc<AtomicBool>,
    pub handle: JobHandle<()>,
    pub job: ScheduledJob,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A min-heap by `(deadline, seq)`: `BinaryHeap` is a max-heap, so entries
/// are wrapped to invert the comparison rather than negating it at every
/// call site.
struct MinOrder(ScheduledTask);

impl PartialEq for MinOrder {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for MinOrder {}
impl PartialOrd for MinOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MinOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}

pub(crate) struct ScheduledHeap {
    heap: BinaryHeap<MinOrder>,
    next_seq: AtomicU64,
}

impl ScheduledHeap {
    pub(crate) fn new() -> Self {
        ScheduledHeap {
            heap: BinaryHeap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub(crate) fn push(&mut self, task: ScheduledTask) {
        self.heap.push(MinOrder(task));
    }

    pub(crate) fn peek_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.0.deadline)
    }

    /// Pops every task whose deadline has passed `now`, in ascending
    /// deadline order.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.0.deadline > now {
                break;
            }
            due.push(self.heap.pop().unwrap().0);
        }
        due
    }

    pub(crate) fn drain_all(&mut self) -> Vec<ScheduledTask> {
        self.heap.drain().map(|m| m.0).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
