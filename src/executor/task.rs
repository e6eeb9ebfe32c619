//! Job representation and the completion handle returned by `submit`/
//! `schedule`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use super::ExecutorError;

pub(crate) type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

enum JobState<T> {
    Pending,
    Done(T),
    Failed(ExecutorError),
    Cancelled,
}

struct JobInner<T> {
    state: Mutex<JobState<T>>,
    cvar: Condvar,
}

/// A handle mirroring the completion of a submitted or scheduled task. The
/// task runs on the owning executor; this handle may be waited on or
/// cancelled from any thread.
pub struct JobHandle<T> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        JobHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> JobHandle<T> {
    fn new() -> (Self, Arc<JobInner<T>>) {
        let inner = Arc::new(JobInner {
            state: Mutex::new(JobState::Pending),
            cvar: Condvar::new(),
        });
        (
            JobHandle {
                inner: Arc::clone(&inner),
            },
            inner,
        )
    }

    /// A handle with no job backing it yet, whose only possible
    /// transitions are `cancel_job`/`fail_job`. Used for repeating
    /// scheduled tasks, which have no single terminal value.
    pub(crate) fn pending() -> Self {
        Self::new().0
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), JobState::Pending)
    }

    /// Blocks the calling thread until the job completes, was cancelled, or
    /// panicked. Re-entrant on the owning executor's own thread would
    /// deadlock; callers must not wait on a handle for a task running on
    /// the thread they're calling from.
    pub fn wait(&self) -> Result<T, ExecutorError>
    where
        T: Clone,
    {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            match &*guard {
                JobState::Pending => guard = self.inner.cvar.wait(guard).unwrap(),
                JobState::Done(v) => return Ok(v.clone()),
                JobState::Failed(e) => return Err(e.clone()),
                JobState::Cancelled => return Err(ExecutorError::Cancelled),
            }
        }
    }

    fn complete(inner: &JobInner<T>, state: JobState<T>) {
        let mut guard = inner.state.lock().unwrap();
        if matches!(*guard, JobState::Pending) {
            *guard = state;
            inner.cvar.notify_all();
        }
    }

    /// Marks this handle `Done`. Used for one-shot scheduled tasks, whose
    /// handle is created before the job closure that will complete it.
    pub(crate) fn force_done(&self, v: T) {
        Self::complete(&self.inner, JobState::Done(v));
    }

    pub(crate) fn force_failed(&self, e: ExecutorError) {
        Self::complete(&self.inner, JobState::Failed(e));
    }
}

/// Wraps a value-producing closure as a [`BoxedJob`] that reports its
/// outcome through the returned [`JobHandle`]. Panics inside `f` are caught
/// and reported as [`ExecutorError::TaskPanicked`], matching the "caught,
/// logged, discarded" failure semantics for the worker while still letting
/// the submitting caller observe the failure.
pub(crate) fn make_job<T, F>(f: F) -> (BoxedJob, JobHandle<T>)
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (handle, inner) = JobHandle::new();
    let job: BoxedJob = Box::new(move || {
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        match result {
            Ok(v) => JobHandle::complete(&inner, JobState::Done(v)),
            Err(_) => JobHandle::complete(
                &inner,
                JobState::Failed(ExecutorError::TaskPanicked),
            ),
        }
    });
    (job, handle)
}

/// Marks an already-constructed handle as failed without ever running its
/// job, used when `execute` rejects a submission outright.
pub(crate) fn fail_job<T: Send + 'static>(handle: &JobHandle<T>, err: ExecutorError) {
    JobHandle::complete(&handle.inner, JobState::Failed(err));
}

pub(crate) fn cancel_job<T: Send + 'static>(handle: &JobHandle<T>) {
    JobHandle::complete(&handle.inner, JobState::Cancelled);
}

/// Runs a fire-and-forget job, catching (and letting the caller log) a
/// panic instead of tearing down the worker thread.
pub(crate) fn run_catching(job: BoxedJob) -> Result<(), ()> {
    panic::catch_unwind(AssertUnwindSafe(job)).map_err(|_| ())
}
