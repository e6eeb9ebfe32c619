//! The executor's main task queue: a bounded MPSC channel plus the
//! rejection policy applied when it's full.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::{ExecutorError, RejectionPolicy};
use crate::executor::task::{run_catching, BoxedJob};

pub(crate) struct TaskQueue {
    sender: Sender<BoxedJob>,
    receiver: Receiver<BoxedJob>,
    policy: RejectionPolicy,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize, policy: RejectionPolicy) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        TaskQueue {
            sender,
            receiver,
            policy,
        }
    }

    pub(crate) fn receiver(&self) -> &Receiver<BoxedJob> {
        &self.receiver
    }

    /// Enqueues `job`, applying the configured rejection policy if the
    /// queue is at `max-pending-tasks`.
    pub(crate) fn offer(&self, job: BoxedJob) -> Result<(), ExecutorError> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => match self.policy {
                RejectionPolicy::Abort => Err(ExecutorError::QueueFull),
                RejectionPolicy::Discard => Ok(()),
                RejectionPolicy::CallerRuns => {
                    let _ = run_catching(job);
                    Ok(())
                }
            },
            Err(TrySendError::Disconnected(_)) => Err(ExecutorError::Terminated),
        }
    }

    /// Enqueue used for re-entrant submissions from the worker's own
    /// thread (e.g. during `shutting-down`), which must never be rejected
    /// by the policy external callers face. A full queue here means the
    /// worker is both the only consumer and the current caller, so a
    /// blocking send would deadlock; run the job inline instead.
    pub(crate) fn offer_internal(&self, job: BoxedJob) {
        if let Err(TrySendError::Full(job)) = self.sender.try_send(job) {
            let _ = run_catching(job);
        }
    }
}
