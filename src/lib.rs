//! Core of an asynchronous, event-driven network framework: a pooled
//! byte-buffer allocator, a per-channel handler pipeline, and a
//! single-threaded event executor (§1, §2).
//!
//! The four subsystems mirror the design's own module boundaries:
//!
//! - [`buf`] — [`buf::ByteBuf`], its pooled and unpooled allocators, and the
//!   leak detector (§4.1).
//! - [`executor`] — [`executor::SingleThreadExecutor`] and
//!   [`executor::ExecutorGroup`] (§4.2).
//! - [`channel`] — the [`channel::Channel`] trait, its lifecycle, and the
//!   `embedded`/`tcp-transport` implementations behind it (§4.3).
//! - [`pipeline`] — [`pipeline::ChannelPipeline`] and [`pipeline::ChannelHandler`]
//!   (§4.4).
//! - [`codec`] — decoder/encoder/transform handlers built on top of a
//!   pipeline, including the length-field frame decoder and flow-control
//!   handler (§6.2, §6.5).
//!
//! See the [`features`] module for what each Cargo feature compiles in.

pub mod buf;
pub mod channel;
pub mod codec;
mod error;
pub mod executor;
pub mod features;
pub mod pipeline;

pub use error::{Error, Result};
