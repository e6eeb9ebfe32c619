//! The executor's `running → shutting-down → shutdown → terminated` state
//! machine and the quiet-period bookkeeping that drives the second
//! transition.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    Running = 0,
    ShuttingDown = 1,
    Shutdown = 2,
    Terminated = 3,
}

impl ExecutorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ExecutorState::Running,
            1 => ExecutorState::ShuttingDown,
            2 => ExecutorState::Shutdown,
            _ => ExecutorState::Terminated,
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        StateCell(AtomicU8::new(ExecutorState::Running as u8))
    }

    pub(crate) fn load(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, s: ExecutorState) {
        self.0.store(s as u8, Ordering::Release);
    }
}

/// Tracks the quiet period during `shutting-down`: every new task
/// submission resets the inactivity clock; the worker exits once either
/// the quiet period elapses with no activity or the absolute timeout is
/// reached.
pub(crate) struct QuietPeriod {
    pub quiet: Duration,
    pub absolute_deadline: Instant,
    pub last_activity: Instant,
}

impl QuietPeriod {
    pub(crate) fn begin(quiet: Duration, timeout: Duration) -> Self {
        let now = Instant::now();
        QuietPeriod {
            quiet,
            absolute_deadline: now + timeout,
            last_activity: now,
        }
    }

    pub(crate) fn note_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub(crate) fn should_finish(&self) -> bool {
        let now = Instant::now();
        now >= self.absolute_deadline || now.duration_since(self.last_activity) >= self.quiet
    }
}
