//! A single-threaded worker: task queue, scheduled-task heap, and the
//! `running → shutting-down → shutdown → terminated` loop described in
//! spec §4.2.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::queue::TaskQueue;
use super::scheduled::{Repeat, ScheduledHeap, ScheduledJob, ScheduledTask};
use super::shutdown::{ExecutorState, QuietPeriod, StateCell};
use super::task::{self, BoxedJob, JobHandle};
use super::{ExecutorConfig, ExecutorError, ExecutorResult};

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_EXECUTOR: Cell<Option<u64>> = const { Cell::new(None) };
}

/// A best-effort cancellation token for a scheduled (possibly repeating)
/// task, paired with the [`JobHandle`] tracking its terminal outcome.
pub struct ScheduledHandle {
    job: JobHandle<()>,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub fn job(&self) -> &JobHandle<()> {
        &self.job
    }

    /// Requests cancellation. Guaranteed to prevent later attempts to run
    /// the task (including future periodic firings); a firing already
    /// pulled off the heap onto the queue still runs to completion.
    pub fn cancel(&self) -> bool {
        let was_cancelled = self.cancelled.swap(true, Ordering::SeqCst);
        if !was_cancelled {
            task::cancel_job(&self.job);
        }
        !was_cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Shared {
    id: u64,
    state: StateCell,
    queue: TaskQueue,
    scheduled: Mutex<ScheduledHeap>,
    quiet: Mutex<Option<QuietPeriod>>,
    config: ExecutorConfig,
}

/// One cooperative worker thread. Owns its task queue and scheduled-task
/// heap; all non-atomic state reachable from jobs it runs is touched only
/// on this thread.
pub struct SingleThreadExecutor {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SingleThreadExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        let shared = Arc::new(Shared {
            id: NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed),
            state: StateCell::new(),
            queue: TaskQueue::new(config.max_pending_tasks, config.rejection_policy),
            scheduled: Mutex::new(ScheduledHeap::new()),
            quiet: Mutex::new(None),
            config,
        });
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || run_loop(worker_shared));
        SingleThreadExecutor {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ExecutorState {
        self.shared.state.load()
    }

    pub fn in_executor(&self) -> bool {
        CURRENT_EXECUTOR.with(|c| c.get()) == Some(self.shared.id)
    }

    fn enqueue(&self, job: BoxedJob) -> ExecutorResult<()> {
        match self.shared.state.load() {
            ExecutorState::Terminated => return Err(ExecutorError::Terminated),
            ExecutorState::ShuttingDown | ExecutorState::Shutdown if !self.in_executor() => {
                return Err(ExecutorError::Rejected);
            }
            _ => {}
        }
        if self.in_executor() {
            self.shared.queue.offer_internal(job);
        } else {
            self.shared.queue.offer(job)?;
        }
        if let Some(quiet) = self.shared.quiet.lock().unwrap().as_mut() {
            quiet.note_activity();
        }
        Ok(())
    }

    /// Enqueues `f`. Thread-safe from any producer; rejected while
    /// `shutting-down`/`shutdown` unless called from this executor's own
    /// thread.
    pub fn execute<F>(&self, f: F) -> ExecutorResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(f))
    }

    /// Enqueues `f` and returns a handle mirroring its completion.
    pub fn submit<T, F>(&self, f: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (job, handle) = task::make_job(f);
        if let Err(e) = self.enqueue(job) {
            task::fail_job(&handle, e);
        }
        handle
    }

    fn push_scheduled(&self, deadline: Instant, repeat: Repeat, job: ScheduledJob) -> ScheduledHandle {
        self.push_scheduled_with_handle(deadline, repeat, job, JobHandle::pending())
    }

    fn push_scheduled_with_handle(
        &self,
        deadline: Instant,
        repeat: Repeat,
        job: ScheduledJob,
        reported: JobHandle<()>,
    ) -> ScheduledHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = ScheduledHandle {
            job: reported,
            cancelled: Arc::clone(&cancelled),
        };
        if matches!(
            self.shared.state.load(),
            ExecutorState::Terminated | ExecutorState::Shutdown
        ) {
            task::fail_job(&handle.job, ExecutorError::Rejected);
            return handle;
        }
        let mut heap = self.shared.scheduled.lock().unwrap();
        let seq = heap.next_seq();
        heap.push(ScheduledTask {
            deadline,
            seq,
            repeat,
            cancelled,
            handle: handle.job.clone(),
            job,
        });
        handle
    }

    /// Runs `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let reported = JobHandle::<()>::pending();
        let completion = reported.clone();
        let boxed: BoxedJob = Box::new(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
            match result {
                Ok(()) => completion.force_done(()),
                Err(_) => completion.force_failed(ExecutorError::TaskPanicked),
            }
        });
        self.push_scheduled_with_handle(
            Instant::now() + delay,
            Repeat::Once,
            ScheduledJob::Once(boxed),
            reported,
        )
    }

    /// Runs `f` every `period`, first firing after `initial_delay`; the
    /// period is measured from the previous deadline, so drift does not
    /// accumulate across firings.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> ScheduledHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.push_scheduled(
            Instant::now() + initial_delay,
            Repeat::FixedRate(period),
            ScheduledJob::Repeating(Arc::new(Mutex::new(f))),
        )
    }

    /// Runs `f`, then `delay` after each run finishes, runs it again.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> ScheduledHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.push_scheduled(
            Instant::now() + initial_delay,
            Repeat::FixedDelay(delay),
            ScheduledJob::Repeating(Arc::new(Mutex::new(f))),
        )
    }

    /// Enters `shutting-down`. The worker exits once either `quiet_period`
    /// elapses with no new submissions or `timeout` elapses, whichever
    /// comes first, then joins the underlying thread.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) {
        *self.shared.quiet.lock().unwrap() = Some(QuietPeriod::begin(quiet_period, timeout));
        self.shared.state.store(ExecutorState::ShuttingDown);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(shared: Arc<Shared>) {
    CURRENT_EXECUTOR.with(|c| c.set(Some(shared.id)));
    let batch = 256usize;
    loop {
        let now = Instant::now();
        let due = shared.scheduled.lock().unwrap().drain_due(now);
        for task in due {
            fire_due_task(&shared, task);
        }

        let mut ran_any = false;
        for _ in 0..batch {
            match shared.queue.receiver().try_recv() {
                Ok(job) => {
                    ran_any = true;
                    if task::run_catching(job).is_err() {
                        log::warn!("executor {}: task panicked", shared.id);
                    }
                }
                Err(_) => break,
            }
        }

        if shared.state.load() == ExecutorState::ShuttingDown {
            let finished = shared
                .quiet
                .lock()
                .unwrap()
                .as_ref()
                .map(QuietPeriod::should_finish)
                .unwrap_or(true);
            if finished {
                shared.state.store(ExecutorState::Shutdown);
                let leftover = shared.scheduled.lock().unwrap().drain_all();
                for task in leftover {
                    task::cancel_job(&task.handle);
                }
                shared.state.store(ExecutorState::Terminated);
                log::debug!("executor {} terminated", shared.id);
                return;
            }
        }

        if !ran_any {
            let wait = shared
                .scheduled
                .lock()
                .unwrap()
                .peek_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(shared.config.break_out_interval)
                .min(shared.config.break_out_interval);
            let _ = shared.queue.receiver().recv_timeout(wait);
        }
    }
}

/// Runs one due scheduled task and, for a repeating task that wasn't
/// cancelled mid-run, pushes its next firing back onto the heap.
fn fire_due_task(shared: &Arc<Shared>, task: ScheduledTask) {
    let ScheduledTask {
        deadline,
        seq: _,
        repeat,
        cancelled,
        handle,
        job,
    } = task;

    if cancelled.load(Ordering::Relaxed) {
        return;
    }

    match job {
        ScheduledJob::Once(boxed) => {
            if task::run_catching(boxed).is_err() {
                log::warn!("executor {}: scheduled task panicked", shared.id);
            }
        }
        ScheduledJob::Repeating(f) => {
            let run_f = Arc::clone(&f);
            let ran = task::run_catching(Box::new(move || {
                (run_f.lock().unwrap())();
            }));
            if ran.is_err() {
                log::warn!("executor {}: scheduled task panicked", shared.id);
            }
            if cancelled.load(Ordering::Relaxed) {
                return;
            }
            let next_deadline = match repeat {
                Repeat::FixedRate(period) => deadline + period,
                Repeat::FixedDelay(delay) => Instant::now() + delay,
                Repeat::Once => return,
            };
            let mut heap = shared.scheduled.lock().unwrap();
            let seq = heap.next_seq();
            heap.push(ScheduledTask {
                deadline: next_deadline,
                seq,
                repeat,
                cancelled,
                handle,
                job: ScheduledJob::Repeating(f),
            });
        }
    }
}
