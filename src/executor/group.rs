//! An executor group: `worker_count` independent [`SingleThreadExecutor`]s
//! multiplexing channels over a fixed pool by a stable assignment function
//! (spec §3 "Executor", §5 "the runtime is parallel at the group level").

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ExecutorConfig, SingleThreadExecutor};

/// Owns a fixed set of workers and assigns each channel to exactly one of
/// them for its lifetime. The assignment function is a stable round robin:
/// calling [`next`](ExecutorGroup::next) twice for the same logical
/// channel is the caller's responsibility (store the returned executor,
/// don't call `next` again for it).
pub struct ExecutorGroup {
    workers: Vec<Arc<SingleThreadExecutor>>,
    cursor: AtomicUsize,
}

impl ExecutorGroup {
    pub fn new(config: ExecutorConfig) -> Self {
        let n = config.worker_count.max(1);
        let workers = (0..n)
            .map(|_| Arc::new(SingleThreadExecutor::new(config)))
            .collect();
        ExecutorGroup {
            workers,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The next worker in round-robin order, the group's channel
    /// assignment function.
    pub fn next(&self) -> Arc<SingleThreadExecutor> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[idx])
    }

    pub fn workers(&self) -> &[Arc<SingleThreadExecutor>] {
        &self.workers
    }

    /// Shuts down every worker in the group with the same quiet
    /// period/timeout, joining each in turn.
    pub fn shutdown_gracefully(&self, quiet_period: std::time::Duration, timeout: std::time::Duration) {
        for worker in &self.workers {
            worker.shutdown_gracefully(quiet_period, timeout);
        }
    }
}
