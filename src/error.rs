//! Crate-wide error aggregation.
//!
//! Each subsystem defines its own error enum scoped to the kinds it can
//! raise (`buf::BufError`, `executor::ExecutorError`, `channel::ChannelError`,
//! `pipeline::PipelineError`, `codec::FrameError`). [`Error`] wraps all five
//! for call sites — a handler's `exception_caught`, for instance — that need
//! a single type to carry whatever went wrong.

use thiserror::Error;

use crate::buf::BufError;
use crate::channel::ChannelError;
use crate::codec::FrameError;
use crate::executor::ExecutorError;
use crate::pipeline::PipelineError;

/// Any error a `weavecore` subsystem can raise.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Buf(#[from] BufError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Convenience alias for fallible crate operations.
pub type Result<T> = std::result::Result<T, Error>;
