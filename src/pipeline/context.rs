//! The per-handler node and the cursor type (`ChannelHandlerContext`)
//! handlers use to continue propagation. Structural state (the `prev`/
//! `next` linked list) lives in a [`slab::Slab`] guarded by its own mutex;
//! each handler is wrapped in its own `Arc<Mutex<_>>` so invoking one never
//! holds the structural lock, letting a handler's own `fire_*` call
//! re-enter the slab without deadlocking itself.

use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::channel::{ChannelError, ChannelPromise};
use crate::executor::SingleThreadExecutor;

use super::handler::{ChannelHandler, HandlerMask, Message, PeerAddr};
use super::PipelineError;

pub(crate) const HEAD_KEY: usize = 0;
pub(crate) const TAIL_KEY: usize = 1;

pub(crate) struct Node {
    pub name: String,
    pub mask: HandlerMask,
    pub executor: Option<Arc<SingleThreadExecutor>>,
    pub prev: usize,
    pub next: usize,
    pub removed: bool,
    pub handler: Arc<Mutex<Box<dyn ChannelHandler>>>,
}

/// What the pipeline's head hands outbound terminal operations to. A
/// concrete channel (`EmbeddedChannel`, `tcp::TcpChannel`) implements this;
/// the pipeline never depends on a specific transport (spec §6.1). Every
/// operation with an observable outcome carries the promise it must settle;
/// `do_read`/`do_flush` don't, matching the promise-less `read`/`flush` on
/// `Channel` itself.
pub trait ChannelOps: Send + Sync {
    fn do_bind(&self, local: PeerAddr, promise: ChannelPromise<ChannelError>);
    fn do_connect(&self, remote: PeerAddr, promise: ChannelPromise<ChannelError>);
    fn do_disconnect(&self, promise: ChannelPromise<ChannelError>);
    fn do_close(&self, promise: ChannelPromise<ChannelError>);
    fn do_deregister(&self, promise: ChannelPromise<ChannelError>);
    fn do_read(&self);
    fn do_write(&self, msg: Message, promise: ChannelPromise<ChannelError>);
    fn do_flush(&self);
}

pub(crate) struct PipelineShared {
    pub nodes: Mutex<Slab<Node>>,
    pub default_executor: Arc<SingleThreadExecutor>,
    pub channel: std::sync::Weak<dyn ChannelOps>,
}

/// A handler's position in the pipeline. Exposes the `fire*` (continue
/// inbound) and outbound-operation methods a handler's default trait
/// methods call to pass an event along (§4.4).
pub struct ChannelHandlerContext {
    pub(crate) shared: Arc<PipelineShared>,
    pub(crate) key: usize,
}

impl ChannelHandlerContext {
    pub fn name(&self) -> String {
        self.shared.nodes.lock().unwrap()[self.key].name.clone()
    }

    /// A handle to this context's owning pipeline, for handlers that need
    /// to mutate the chain from within an event callback (spec §4.4
    /// "dynamic mutation during traversal").
    pub fn pipeline(&self) -> super::ChannelPipeline {
        super::ChannelPipeline::from_shared(Arc::clone(&self.shared))
    }

    fn executor_for(&self, key: usize) -> Arc<SingleThreadExecutor> {
        let nodes = self.shared.nodes.lock().unwrap();
        nodes[key]
            .executor
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.shared.default_executor))
    }

    /// Finds the next live context at or after `key` (exclusive of `key`
    /// itself) whose mask includes `kind`, walking toward the tail.
    fn find_inbound(&self, kind: HandlerMask) -> Option<usize> {
        let nodes = self.shared.nodes.lock().unwrap();
        let mut cur = nodes[self.key].next;
        loop {
            if cur == TAIL_KEY {
                return Some(TAIL_KEY);
            }
            let node = &nodes[cur];
            if !node.removed && node.mask.contains(kind) {
                return Some(cur);
            }
            cur = node.next;
        }
    }

    /// Finds the next live context at or before `key` (exclusive), walking
    /// toward the head, for outbound propagation.
    fn find_outbound(&self, kind: HandlerMask) -> Option<usize> {
        let nodes = self.shared.nodes.lock().unwrap();
        let mut cur = nodes[self.key].prev;
        loop {
            if cur == HEAD_KEY {
                return Some(HEAD_KEY);
            }
            let node = &nodes[cur];
            if !node.removed && node.mask.contains(kind) {
                return Some(cur);
            }
            cur = node.prev;
        }
    }

    fn handler_at(&self, key: usize) -> Arc<Mutex<Box<dyn ChannelHandler>>> {
        Arc::clone(&self.shared.nodes.lock().unwrap()[key].handler)
    }

    /// Invokes `key`'s handler via `run`, hopping onto its executor first
    /// if it differs from whichever executor we're currently running on
    /// (spec §4.4 "cross-executor hops queue the event").
    fn dispatch(&self, key: usize, run: impl FnOnce(ChannelHandlerContext) + Send + 'static) {
        let executor = self.executor_for(key);
        let ctx = ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key,
        };
        if executor.in_executor() {
            run(ctx);
        } else {
            let _ = executor.execute(move || run(ctx));
        }
    }

    fn fire(&self, kind: HandlerMask, run: impl FnOnce(&mut dyn ChannelHandler, &ChannelHandlerContext) + Send + 'static) {
        let Some(target) = self.find_inbound(kind) else {
            return;
        };
        self.dispatch(target, move |ctx| {
            let handler = ctx.handler_at(target);
            run(&mut **handler.lock().unwrap(), &ctx);
        });
    }

    fn bubble(&self, kind: HandlerMask, run: impl FnOnce(&mut dyn ChannelHandler, &ChannelHandlerContext) + Send + 'static) {
        let Some(target) = self.find_outbound(kind) else {
            return;
        };
        self.dispatch(target, move |ctx| {
            let handler = ctx.handler_at(target);
            run(&mut **handler.lock().unwrap(), &ctx);
        });
    }

    pub fn fire_channel_registered(&self) {
        self.fire(HandlerMask::REGISTER, |h, ctx| h.channel_registered(ctx));
    }
    pub fn fire_channel_unregistered(&self) {
        self.fire(HandlerMask::UNREGISTER, |h, ctx| h.channel_unregistered(ctx));
    }
    pub fn fire_channel_active(&self) {
        self.fire(HandlerMask::ACTIVE, |h, ctx| h.channel_active(ctx));
    }
    pub fn fire_channel_inactive(&self) {
        self.fire(HandlerMask::INACTIVE, |h, ctx| h.channel_inactive(ctx));
    }
    pub fn fire_channel_read(&self, msg: Message) {
        self.fire(HandlerMask::CHANNEL_READ, move |h, ctx| h.channel_read(ctx, msg));
    }
    pub fn fire_channel_read_complete(&self) {
        self.fire(HandlerMask::READ_COMPLETE, |h, ctx| h.channel_read_complete(ctx));
    }
    pub fn fire_user_event_triggered(&self, evt: Message) {
        self.fire(HandlerMask::USER_EVENT, move |h, ctx| h.user_event_triggered(ctx, evt));
    }
    pub fn fire_writability_changed(&self, writable: bool) {
        self.fire(HandlerMask::WRITABILITY_CHANGED, move |h, ctx| {
            h.writability_changed(ctx, writable)
        });
    }
    /// Continues exception propagation toward the tail. If `run`'s handler
    /// itself panics the pipeline does not catch it here — callers invoking
    /// handler code from executor task closures rely on the executor's own
    /// `catch_unwind` (§4.2) for that.
    pub fn fire_exception_caught(&self, err: PipelineError) {
        self.fire(HandlerMask::EXCEPTION_CAUGHT, move |h, ctx| h.exception_caught(ctx, err));
    }

    pub fn bind(&self, local: PeerAddr, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::BIND, move |h, ctx| h.bind(ctx, local, promise));
    }
    pub fn connect(&self, remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::CONNECT, move |h, ctx| h.connect(ctx, remote, promise));
    }
    pub fn disconnect(&self, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::DISCONNECT, move |h, ctx| h.disconnect(ctx, promise));
    }
    pub fn close(&self, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::CLOSE, move |h, ctx| h.close(ctx, promise));
    }
    pub fn deregister(&self, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::DEREGISTER, move |h, ctx| h.deregister(ctx, promise));
    }
    pub fn read(&self) {
        self.bubble(HandlerMask::READ, |h, ctx| h.read(ctx));
    }
    pub fn write(&self, msg: Message, promise: ChannelPromise<ChannelError>) {
        self.bubble(HandlerMask::WRITE, move |h, ctx| h.write(ctx, msg, promise));
    }
    pub fn flush(&self) {
        self.bubble(HandlerMask::FLUSH, |h, ctx| h.flush(ctx));
    }
}
