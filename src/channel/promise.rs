//! The completion handle returned by a channel's control operations and
//! attached to each queued write (spec §4.3 "each with a promise"). Shaped
//! like [`crate::executor::JobHandle`] (the same `Arc<Mutex<_>> + Condvar`
//! wait pattern) but generic over the error a channel operation can fail
//! with, rather than hard-wired to `ExecutorError`.

use std::sync::{Arc, Condvar, Mutex};

enum State<E> {
    Pending,
    Done,
    Failed(E),
}

struct Inner<E> {
    state: Mutex<State<E>>,
    cvar: Condvar,
}

/// A handle mirroring the completion of `bind`/`connect`/`disconnect`/
/// `close`/`register`/`deregister` or a single queued write.
pub struct ChannelPromise<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for ChannelPromise<E> {
    fn clone(&self) -> Self {
        ChannelPromise {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone> ChannelPromise<E> {
    pub fn pending() -> Self {
        ChannelPromise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock().unwrap(), State::Pending)
    }

    pub fn succeed(&self) {
        self.complete(State::Done);
    }

    pub fn fail(&self, err: E) {
        self.complete(State::Failed(err));
    }

    fn complete(&self, state: State<E>) {
        let mut guard = self.inner.state.lock().unwrap();
        if matches!(*guard, State::Pending) {
            *guard = state;
            self.inner.cvar.notify_all();
        }
    }

    /// Blocks until the operation completes.
    pub fn wait(&self) -> Result<(), E> {
        let mut guard = self.inner.state.lock().unwrap();
        loop {
            match &*guard {
                State::Pending => guard = self.inner.cvar.wait(guard).unwrap(),
                State::Done => return Ok(()),
                State::Failed(e) => return Err(e.clone()),
            }
        }
    }
}
