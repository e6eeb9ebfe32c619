//! The cooperative single-threaded event executor: a task queue, a
//! scheduled-task heap, and a graceful shutdown state machine (§4.2), plus
//! [`ExecutorGroup`] which multiplexes channels over a fixed pool of them.

mod group;
mod queue;
mod scheduled;
mod shutdown;
mod single_thread;
mod task;

pub use group::ExecutorGroup;
pub use shutdown::ExecutorState;
pub use single_thread::SingleThreadExecutor;
pub use task::JobHandle;

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the executor subsystem (spec §7 kinds 1 and 6, as they
/// apply to task submission and scheduling rather than channel lifecycle).
#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    #[error("task rejected: executor is shutting down")]
    Rejected,
    #[error("task rejected: queue is at capacity")]
    QueueFull,
    #[error("executor has terminated")]
    Terminated,
    #[error("task panicked")]
    TaskPanicked,
    #[error("task was cancelled")]
    Cancelled,
}

pub(crate) type ExecutorResult<T> = Result<T, ExecutorError>;

/// What happens to a submission that arrives when the main queue is at
/// `max-pending-tasks` (spec §6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionPolicy {
    /// Reject with [`ExecutorError::QueueFull`].
    Abort,
    /// Silently drop the task.
    Discard,
    /// Run the task synchronously on the submitting thread.
    CallerRuns,
}

/// Recognized executor options (spec §6.4).
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Workers in the group this executor belongs to (§4.2 "executor
    /// group"); a bare [`SingleThreadExecutor`] ignores this field.
    pub worker_count: usize,
    /// Upper bound on time spent in one phase of the run loop (draining
    /// scheduled tasks, or running a batch) before checking for new I/O.
    pub break_out_interval: Duration,
    /// Capacity of the main task queue.
    pub max_pending_tasks: usize,
    pub rejection_policy: RejectionPolicy,
    pub shutdown_quiet_period: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            break_out_interval: Duration::from_millis(50),
            max_pending_tasks: 16 * 1024,
            rejection_policy: RejectionPolicy::Abort,
            shutdown_quiet_period: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }

    pub fn with_break_out_interval(mut self, d: Duration) -> Self {
        self.break_out_interval = d;
        self
    }

    pub fn with_max_pending_tasks(mut self, n: usize) -> Self {
        self.max_pending_tasks = n;
        self
    }

    pub fn with_rejection_policy(mut self, p: RejectionPolicy) -> Self {
        self.rejection_policy = p;
        self
    }

    pub fn with_shutdown(mut self, quiet: Duration, timeout: Duration) -> Self {
        self.shutdown_quiet_period = quiet;
        self.shutdown_timeout = timeout;
        self
    }
}
