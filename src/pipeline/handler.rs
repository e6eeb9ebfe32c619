//! The handler trait and the per-handler event mask that lets a pipeline
//! skip contexts that don't implement a given event kind (§9 "static
//! dispatch over interfaces").
//!
//! Mirrors the teacher's [`Interests`](https://docs.rs/mio/latest/mio/struct.Interest.html)-
//! style bitset: a small `repr(transparent)` wrapper over an integer with
//! `const` flag values and the usual set operators, rather than pulling in
//! the `bitflags` crate for seventeen bits.

use std::any::Any;
use std::ops::{BitOr, BitOrAssign};

use crate::channel::{ChannelError, ChannelPromise};

use super::context::ChannelHandlerContext;
use super::PipelineError;

/// A message flowing through the pipeline after it has left its original
/// wire representation. Codecs and application handlers exchange whatever
/// concrete type they agree on; the pipeline itself is not generic over it,
/// matching the core's refusal to define wire formats (spec §1 non-goals).
pub type Message = Box<dyn Any + Send>;

/// Which event kinds a handler's context should deliver to it. A context
/// whose handler's mask excludes a kind is skipped during traversal for
/// that kind — the handler is never called, not called-and-ignored.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct HandlerMask(u32);

macro_rules! flags {
    ($($name:ident = $bit:expr;)*) => {
        impl HandlerMask {
            $(pub const $name: HandlerMask = HandlerMask(1 << $bit);)*
        }
    };
}

flags! {
    REGISTER = 0;
    UNREGISTER = 1;
    ACTIVE = 2;
    INACTIVE = 3;
    CHANNEL_READ = 4;
    READ_COMPLETE = 5;
    USER_EVENT = 6;
    WRITABILITY_CHANGED = 7;
    EXCEPTION_CAUGHT = 8;
    BIND = 9;
    CONNECT = 10;
    DISCONNECT = 11;
    CLOSE = 12;
    DEREGISTER = 13;
    READ = 14;
    WRITE = 15;
    FLUSH = 16;
}

impl HandlerMask {
    pub const NONE: HandlerMask = HandlerMask(0);
    pub const ALL: HandlerMask = HandlerMask(u32::MAX);

    pub const fn contains(self, other: HandlerMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for HandlerMask {
    type Output = HandlerMask;
    fn bitor(self, rhs: HandlerMask) -> HandlerMask {
        HandlerMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for HandlerMask {
    fn bitor_assign(&mut self, rhs: HandlerMask) {
        self.0 |= rhs.0;
    }
}

/// An address or error observed on an inbound/outbound operation. Kept
/// minimal; concrete transports attach their own address type through
/// `Message` for anything richer.
pub type PeerAddr = std::net::SocketAddr;

/// A stage in a channel's pipeline. Every method has a pass-through default
/// that simply continues propagation, matching the teacher's posture of
/// cheap, mostly-empty default trait methods (`event::Source`'s optional
/// `register`/`reregister`/`deregister` triad) — a handler overrides only
/// what it cares about and declares that subset in [`mask`](Self::mask).
#[allow(unused_variables)]
pub trait ChannelHandler: Send {
    /// Event kinds this handler participates in. Defaults to all of them;
    /// a handler that only cares about a few kinds should narrow this for
    /// the traversal skip-ahead optimization described in the module docs.
    fn mask(&self) -> HandlerMask {
        HandlerMask::ALL
    }

    fn handler_added(&mut self, ctx: &ChannelHandlerContext) {}
    fn handler_removed(&mut self, ctx: &ChannelHandlerContext) {}

    fn channel_registered(&mut self, ctx: &ChannelHandlerContext) {
        ctx.fire_channel_registered();
    }
    fn channel_unregistered(&mut self, ctx: &ChannelHandlerContext) {
        ctx.fire_channel_unregistered();
    }
    fn channel_active(&mut self, ctx: &ChannelHandlerContext) {
        ctx.fire_channel_active();
    }
    fn channel_inactive(&mut self, ctx: &ChannelHandlerContext) {
        ctx.fire_channel_inactive();
    }
    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        ctx.fire_channel_read(msg);
    }
    fn channel_read_complete(&mut self, ctx: &ChannelHandlerContext) {
        ctx.fire_channel_read_complete();
    }
    fn user_event_triggered(&mut self, ctx: &ChannelHandlerContext, evt: Message) {
        ctx.fire_user_event_triggered(evt);
    }
    fn writability_changed(&mut self, ctx: &ChannelHandlerContext, writable: bool) {
        ctx.fire_writability_changed(writable);
    }
    /// An exception reached this handler. The default forwards toward the
    /// tail, which logs (§4.4 exception propagation).
    fn exception_caught(&mut self, ctx: &ChannelHandlerContext, err: PipelineError) {
        ctx.fire_exception_caught(err);
    }

    fn bind(&mut self, ctx: &ChannelHandlerContext, local: PeerAddr, promise: ChannelPromise<ChannelError>) {
        ctx.bind(local, promise);
    }
    fn connect(&mut self, ctx: &ChannelHandlerContext, remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
        ctx.connect(remote, promise);
    }
    fn disconnect(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        ctx.disconnect(promise);
    }
    fn close(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        ctx.close(promise);
    }
    fn deregister(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        ctx.deregister(promise);
    }
    fn read(&mut self, ctx: &ChannelHandlerContext) {
        ctx.read();
    }
    fn write(&mut self, ctx: &ChannelHandlerContext, msg: Message, promise: ChannelPromise<ChannelError>) {
        ctx.write(msg, promise);
    }
    fn flush(&mut self, ctx: &ChannelHandlerContext) {
        ctx.flush();
    }
}
