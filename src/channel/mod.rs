//! The abstract I/O endpoint: identity, configuration, outbound buffer,
//! and the four-state lifecycle a concrete transport drives (§3, §4.3).

mod config;
#[cfg(feature = "embedded")]
pub mod embedded;
mod outbound_buffer;
mod promise;
#[cfg(feature = "tcp-transport")]
pub mod tcp;

pub use config::{ChannelConfig, WaterMark};
pub use outbound_buffer::ChannelOutboundBuffer;
pub use promise::ChannelPromise;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::buf::ByteBuf;
use crate::executor::SingleThreadExecutor;
use crate::pipeline::{ChannelPipeline, Message};
use std::sync::Arc;

/// Best-effort byte size of a pipeline message, used to feed the outbound
/// buffer's water-mark accounting. Messages that aren't a recognized byte
/// container count as zero — a handler emitting a custom message type after
/// a message-to-message transform is outside what water marks track.
pub fn message_byte_size(msg: &Message) -> usize {
    if let Some(buf) = msg.downcast_ref::<ByteBuf>() {
        return buf.readable_bytes();
    }
    if let Some(bytes) = msg.downcast_ref::<Vec<u8>>() {
        return bytes.len();
    }
    0
}

/// Errors raised by channel lifecycle and I/O operations (spec §7 kinds 1
/// and 5).
#[derive(Debug, Error, Clone)]
pub enum ChannelError {
    #[error("channel {0} is not registered to an executor")]
    NotRegistered(ChannelId),
    #[error("channel {0} is already registered to an executor")]
    AlreadyRegistered(ChannelId),
    #[error("channel {0} is closed")]
    Closed(ChannelId),
    #[error("connect to {0} timed out")]
    ConnectTimedOut(SocketAddr),
    #[error("peer reset the connection")]
    ConnectionReset,
    #[error("write failed")]
    WriteFailed,
    #[error("unexpected end of stream")]
    Eof,
    #[error("{0}")]
    Io(String),
}

/// A 128-bit opaque channel identity (spec §3), printable in a short
/// (8 hex digit) or long (32 hex digit) form. Generated from a
/// process-local sequence mixed with wall-clock time rather than a UUID
/// dependency — uniqueness across one process's channel population is all
/// this core needs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(u128);

impl ChannelId {
    pub fn new() -> Self {
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) as u128;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let pid = std::process::id() as u128;
        ChannelId((pid << 96) ^ (nanos << 16) ^ seq)
    }

    pub fn short_text(&self) -> String {
        format!("{:08x}", (self.0 & 0xffff_ffff) as u32)
    }

    pub fn long_text(&self) -> String {
        format!("{:032x}", self.0)
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        ChannelId::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_text())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.long_text())
    }
}

/// The four-state lifecycle every channel passes through (§4.3). A
/// deregister-then-register cycle is the only permitted transition back to
/// an earlier state, dropping from `Active` to `Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Registered,
    Active,
    Closed,
}

impl ChannelState {
    /// Whether `next` is a legal transition from `self`.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        matches!(
            (self, next),
            (Created, Registered)
                | (Registered, Active)
                | (Registered, Closed)
                | (Active, Closed)
                | (Active, Registered) // deregister then register again
        )
    }
}

/// The common surface every concrete channel (`embedded::EmbeddedChannel`,
/// `tcp::TcpChannel`) exposes to application code. Control operations
/// return a [`ChannelPromise`] and traverse the pipeline tail-to-head
/// (§4.3).
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;
    fn state(&self) -> ChannelState;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
    fn pipeline(&self) -> &ChannelPipeline;
    fn executor(&self) -> &Arc<SingleThreadExecutor>;
    fn is_writable(&self) -> bool;

    fn bind(&self, local: SocketAddr) -> ChannelPromise<ChannelError>;
    fn connect(&self, remote: SocketAddr) -> ChannelPromise<ChannelError>;
    fn disconnect(&self) -> ChannelPromise<ChannelError>;
    fn close(&self) -> ChannelPromise<ChannelError>;
    fn deregister(&self) -> ChannelPromise<ChannelError>;

    /// Signals the transport to demand more data. Meaningful only when
    /// `auto_read` is off (§4.3).
    fn read(&self);
    fn write(&self, msg: Message) -> ChannelPromise<ChannelError>;
    fn flush(&self);
    fn write_and_flush(&self, msg: Message) -> ChannelPromise<ChannelError> {
        let promise = self.write(msg);
        self.flush();
        promise
    }
}
