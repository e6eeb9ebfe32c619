//! The per-channel handler pipeline: an ordered, mutable chain of handler
//! contexts between a head (outbound leaf, talks to the transport) and a
//! tail (inbound catch-all) sentinel (§3, §4.4).

mod context;
mod handler;

pub use context::{ChannelHandlerContext, ChannelOps};
pub use handler::{ChannelHandler, HandlerMask, Message, PeerAddr};

use std::sync::{Arc, Mutex};

use slab::Slab;
use thiserror::Error;

use crate::channel::{ChannelError, ChannelPromise};
use crate::executor::SingleThreadExecutor;
use context::{ChannelHandlerContext, Node, PipelineShared, HEAD_KEY, TAIL_KEY};

/// Errors raised by the pipeline (spec §7 kind 1, as it applies to handler
/// mutation, plus the unhandled-exception carrier used by
/// `exception_caught`).
#[derive(Debug, Error, Clone)]
pub enum PipelineError {
    #[error("handler name {0:?} already present in this pipeline")]
    DuplicateName(String),
    #[error("no handler named {0:?} in this pipeline")]
    NoSuchHandler(String),
    #[error("{0}")]
    Other(String),
}

/// The channel behind this context has already been torn down (its `Weak`
/// no longer upgrades) before the operation reached the head. Rather than
/// leave the promise pending forever, fail it — a caller blocked on
/// `.wait()` deserves an answer.
fn fail_no_channel(promise: ChannelPromise<ChannelError>) {
    promise.fail(ChannelError::Io("channel dropped before operation ran".to_string()));
}

struct HeadHandler;
impl ChannelHandler for HeadHandler {
    fn mask(&self) -> HandlerMask {
        HandlerMask::ALL
    }
    fn bind(&mut self, ctx: &ChannelHandlerContext, local: PeerAddr, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_bind(local, promise),
            None => fail_no_channel(promise),
        }
    }
    fn connect(&mut self, ctx: &ChannelHandlerContext, remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_connect(remote, promise),
            None => fail_no_channel(promise),
        }
    }
    fn disconnect(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_disconnect(promise),
            None => fail_no_channel(promise),
        }
    }
    fn close(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_close(promise),
            None => fail_no_channel(promise),
        }
    }
    fn deregister(&mut self, ctx: &ChannelHandlerContext, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_deregister(promise),
            None => fail_no_channel(promise),
        }
    }
    fn read(&mut self, ctx: &ChannelHandlerContext) {
        if let Some(ch) = ctx_channel(ctx) {
            ch.do_read();
        }
    }
    fn write(&mut self, ctx: &ChannelHandlerContext, msg: Message, promise: ChannelPromise<ChannelError>) {
        match ctx_channel(ctx) {
            Some(ch) => ch.do_write(msg, promise),
            None => fail_no_channel(promise),
        }
    }
    fn flush(&mut self, ctx: &ChannelHandlerContext) {
        if let Some(ch) = ctx_channel(ctx) {
            ch.do_flush();
        }
    }
}

fn ctx_channel(ctx: &ChannelHandlerContext) -> Option<Arc<dyn ChannelOps>> {
    ctx.shared.channel.upgrade()
}

struct TailHandler;
impl ChannelHandler for TailHandler {
    fn mask(&self) -> HandlerMask {
        HandlerMask::ALL
    }
    // Every inbound default is a dead end: the tail is the last context,
    // so unlike a regular handler it must not call `ctx.fire_*` again.
    fn channel_registered(&mut self, _ctx: &ChannelHandlerContext) {}
    fn channel_unregistered(&mut self, _ctx: &ChannelHandlerContext) {}
    fn channel_active(&mut self, _ctx: &ChannelHandlerContext) {}
    fn channel_inactive(&mut self, _ctx: &ChannelHandlerContext) {}
    fn channel_read(&mut self, _ctx: &ChannelHandlerContext, _msg: Message) {
        log::trace!("message reached the tail of the pipeline unhandled");
    }
    fn channel_read_complete(&mut self, _ctx: &ChannelHandlerContext) {}
    fn user_event_triggered(&mut self, _ctx: &ChannelHandlerContext, _evt: Message) {}
    fn writability_changed(&mut self, _ctx: &ChannelHandlerContext, _writable: bool) {}
    fn exception_caught(&mut self, _ctx: &ChannelHandlerContext, err: PipelineError) {
        log::warn!("unhandled exception reached the end of the pipeline: {err}");
    }
}

/// Where in the chain a handler is inserted.
enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// The chain itself. Construction requires the channel's bound executor
/// (the default for contexts with no per-handler override) and a weak
/// handle to the channel's I/O operations, which only the head ever calls.
pub struct ChannelPipeline {
    shared: Arc<PipelineShared>,
}

impl ChannelPipeline {
    pub(crate) fn from_shared(shared: Arc<PipelineShared>) -> Self {
        ChannelPipeline { shared }
    }

    pub fn new(executor: Arc<SingleThreadExecutor>, channel: std::sync::Weak<dyn ChannelOps>) -> Self {
        let mut nodes = Slab::with_capacity(8);
        let head_key = nodes.insert(Node {
            name: "head".to_string(),
            mask: HandlerMask::ALL,
            executor: None,
            prev: 0,
            next: TAIL_KEY,
            removed: false,
            handler: Arc::new(Mutex::new(Box::new(HeadHandler))),
        });
        debug_assert_eq!(head_key, HEAD_KEY);
        let tail_key = nodes.insert(Node {
            name: "tail".to_string(),
            mask: HandlerMask::ALL,
            executor: None,
            prev: HEAD_KEY,
            next: 0,
            removed: false,
            handler: Arc::new(Mutex::new(Box::new(TailHandler))),
        });
        debug_assert_eq!(tail_key, TAIL_KEY);

        ChannelPipeline {
            shared: Arc::new(PipelineShared {
                nodes: Mutex::new(nodes),
                default_executor: executor,
                channel,
            }),
        }
    }

    fn head_ctx(&self) -> ChannelHandlerContext {
        ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key: HEAD_KEY,
        }
    }

    fn tail_ctx(&self) -> ChannelHandlerContext {
        ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key: TAIL_KEY,
        }
    }

    fn key_for(&self, name: &str) -> Option<usize> {
        let nodes = self.shared.nodes.lock().unwrap();
        nodes
            .iter()
            .find(|(_, n)| !n.removed && n.name == name)
            .map(|(k, _)| k)
    }

    fn insert(
        &self,
        pos: Position<'_>,
        name: String,
        handler: Box<dyn ChannelHandler>,
        executor: Option<Arc<SingleThreadExecutor>>,
    ) -> Result<(), PipelineError> {
        {
            let nodes = self.shared.nodes.lock().unwrap();
            if nodes.iter().any(|(_, n)| !n.removed && n.name == name) {
                return Err(PipelineError::DuplicateName(name));
            }
        }
        let (prev_key, next_key) = match pos {
            Position::First => (HEAD_KEY, self.shared.nodes.lock().unwrap()[HEAD_KEY].next),
            Position::Last => (self.shared.nodes.lock().unwrap()[TAIL_KEY].prev, TAIL_KEY),
            Position::Before(n) => {
                let next_key = self
                    .key_for(n)
                    .ok_or_else(|| PipelineError::NoSuchHandler(n.to_string()))?;
                (self.shared.nodes.lock().unwrap()[next_key].prev, next_key)
            }
            Position::After(n) => {
                let prev_key = self
                    .key_for(n)
                    .ok_or_else(|| PipelineError::NoSuchHandler(n.to_string()))?;
                (prev_key, self.shared.nodes.lock().unwrap()[prev_key].next)
            }
        };

        let mask = handler.mask();
        let key = {
            let mut nodes = self.shared.nodes.lock().unwrap();
            nodes.insert(Node {
                name,
                mask,
                executor,
                prev: prev_key,
                next: next_key,
                removed: false,
                handler: Arc::new(Mutex::new(handler)),
            })
        };
        // The new node is not yet linked into the chain, so traversal can't
        // reach it while `handler_added` runs (§4.4).
        let ctx = ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key,
        };
        let handler_arc = Arc::clone(&self.shared.nodes.lock().unwrap()[key].handler);
        handler_arc.lock().unwrap().handler_added(&ctx);

        let mut nodes = self.shared.nodes.lock().unwrap();
        nodes[prev_key].next = key;
        nodes[next_key].prev = key;
        nodes[key].prev = prev_key;
        nodes[key].next = next_key;
        Ok(())
    }

    pub fn add_first(&self, name: impl Into<String>, handler: Box<dyn ChannelHandler>) -> Result<(), PipelineError> {
        self.insert(Position::First, name.into(), handler, None)
    }

    pub fn add_last(&self, name: impl Into<String>, handler: Box<dyn ChannelHandler>) -> Result<(), PipelineError> {
        self.insert(Position::Last, name.into(), handler, None)
    }

    pub fn add_before(
        &self,
        before: &str,
        name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), PipelineError> {
        self.insert(Position::Before(before), name.into(), handler, None)
    }

    pub fn add_after(
        &self,
        after: &str,
        name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), PipelineError> {
        self.insert(Position::After(after), name.into(), handler, None)
    }

    pub fn add_last_on(
        &self,
        name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
        executor: Arc<SingleThreadExecutor>,
    ) -> Result<(), PipelineError> {
        self.insert(Position::Last, name.into(), handler, Some(executor))
    }

    /// Unlinks `name` from the chain and fires its `handler_removed`
    /// callback. Events already dispatched to this context's executor
    /// before the unlink ran still complete (they hold the handler's own
    /// `Arc` directly), matching the drain-before-removed-fires semantics
    /// of §4.4.
    pub fn remove(&self, name: &str) -> Result<(), PipelineError> {
        let key = self
            .key_for(name)
            .ok_or_else(|| PipelineError::NoSuchHandler(name.to_string()))?;
        let (prev_key, next_key, handler_arc) = {
            let mut nodes = self.shared.nodes.lock().unwrap();
            nodes[key].removed = true;
            let prev_key = nodes[key].prev;
            let next_key = nodes[key].next;
            nodes[prev_key].next = next_key;
            nodes[next_key].prev = prev_key;
            (prev_key, next_key, Arc::clone(&nodes[key].handler))
        };
        let _ = (prev_key, next_key);
        let ctx = ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key,
        };
        handler_arc.lock().unwrap().handler_removed(&ctx);
        self.shared.nodes.lock().unwrap().remove(key);
        Ok(())
    }

    /// Replaces `name`'s handler in place, preserving its position. Fires
    /// the old handler's `handler_removed` then the new one's
    /// `handler_added`.
    pub fn replace(
        &self,
        name: &str,
        new_name: impl Into<String>,
        handler: Box<dyn ChannelHandler>,
    ) -> Result<(), PipelineError> {
        let new_name = new_name.into();
        let key = self
            .key_for(name)
            .ok_or_else(|| PipelineError::NoSuchHandler(name.to_string()))?;
        if new_name != name && self.key_for(&new_name).is_some() {
            return Err(PipelineError::DuplicateName(new_name));
        }
        let old_handler = {
            let mut nodes = self.shared.nodes.lock().unwrap();
            let mask = handler.mask();
            let old = std::mem::replace(&mut nodes[key].handler, Arc::new(Mutex::new(handler)));
            nodes[key].mask = mask;
            nodes[key].name = new_name;
            old
        };
        let ctx = ChannelHandlerContext {
            shared: Arc::clone(&self.shared),
            key,
        };
        old_handler.lock().unwrap().handler_removed(&ctx);
        Arc::clone(&self.shared.nodes.lock().unwrap()[key].handler)
            .lock()
            .unwrap()
            .handler_added(&ctx);
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.shared
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, n)| *k != HEAD_KEY && *k != TAIL_KEY && !n.removed)
            .map(|(_, n)| n.name.clone())
            .collect()
    }

    // Inbound entry points, invoked by the channel/transport.
    pub fn fire_channel_registered(&self) {
        self.head_ctx().fire_channel_registered();
    }
    pub fn fire_channel_unregistered(&self) {
        self.head_ctx().fire_channel_unregistered();
    }
    pub fn fire_channel_active(&self) {
        self.head_ctx().fire_channel_active();
    }
    pub fn fire_channel_inactive(&self) {
        self.head_ctx().fire_channel_inactive();
    }
    pub fn fire_channel_read(&self, msg: Message) {
        self.head_ctx().fire_channel_read(msg);
    }
    pub fn fire_channel_read_complete(&self) {
        self.head_ctx().fire_channel_read_complete();
    }
    pub fn fire_user_event_triggered(&self, evt: Message) {
        self.head_ctx().fire_user_event_triggered(evt);
    }
    pub fn fire_writability_changed(&self, writable: bool) {
        self.head_ctx().fire_writability_changed(writable);
    }
    pub fn fire_exception_caught(&self, err: PipelineError) {
        self.head_ctx().fire_exception_caught(err);
    }

    // Outbound entry points, invoked by the channel's public API.
    pub fn bind(&self, local: PeerAddr, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().bind(local, promise);
    }
    pub fn connect(&self, remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().connect(remote, promise);
    }
    pub fn disconnect(&self, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().disconnect(promise);
    }
    pub fn close(&self, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().close(promise);
    }
    pub fn deregister(&self, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().deregister(promise);
    }
    pub fn read(&self) {
        self.tail_ctx().read();
    }
    pub fn write(&self, msg: Message, promise: ChannelPromise<ChannelError>) {
        self.tail_ctx().write(msg, promise);
    }
    pub fn flush(&self) {
        self.tail_ctx().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct NoopOps;
    impl ChannelOps for NoopOps {
        fn do_bind(&self, _local: PeerAddr, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_connect(&self, _remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_disconnect(&self, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_close(&self, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_deregister(&self, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_read(&self) {}
        fn do_write(&self, _msg: Message, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_flush(&self) {}
    }

    fn new_test_pipeline() -> (Arc<SingleThreadExecutor>, ChannelPipeline) {
        let executor = Arc::new(SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1)));
        let ops: Arc<dyn ChannelOps> = Arc::new(NoopOps);
        let pipeline = ChannelPipeline::new(Arc::clone(&executor), Arc::downgrade(&ops));
        (executor, pipeline)
    }

    struct CountingHandler(Arc<AtomicUsize>);
    impl ChannelHandler for CountingHandler {
        fn mask(&self) -> HandlerMask {
            HandlerMask::CHANNEL_READ
        }
        fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
            ctx.fire_channel_read(msg);
        }
    }

    /// Adds a handler named `h2` after itself the first time it sees a
    /// message, then re-fires the same message. Linking happens
    /// synchronously before the re-fire, so `h2` observes this message too,
    /// not just later ones (spec §8 end-to-end scenario 1).
    struct AddsH2OnFirstRead {
        added: bool,
        h2_count: Arc<AtomicUsize>,
    }
    impl ChannelHandler for AddsH2OnFirstRead {
        fn mask(&self) -> HandlerMask {
            HandlerMask::CHANNEL_READ
        }
        fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
            if !self.added {
                self.added = true;
                ctx.pipeline()
                    .add_after("h1", "h2", Box::new(CountingHandler(Arc::clone(&self.h2_count))))
                    .unwrap();
            }
            ctx.fire_channel_read(msg);
        }
    }

    #[test]
    fn add_during_read_observes_new_handler_on_next_message() {
        let (executor, pipeline) = new_test_pipeline();
        let h2_count = Arc::new(AtomicUsize::new(0));

        pipeline
            .add_last(
                "h1",
                Box::new(AddsH2OnFirstRead {
                    added: false,
                    h2_count: Arc::clone(&h2_count),
                }),
            )
            .unwrap();

        let pipeline = Arc::new(pipeline);
        let p1 = Arc::clone(&pipeline);
        executor.submit(move || p1.fire_channel_read(Box::new(1u8))).wait().unwrap();
        // h2 is linked in before h1's re-fire, so it sees this message too.
        assert_eq!(h2_count.load(Ordering::SeqCst), 1);

        let p2 = Arc::clone(&pipeline);
        executor.submit(move || p2.fire_channel_read(Box::new(2u8))).wait().unwrap();
        assert_eq!(h2_count.load(Ordering::SeqCst), 2);

        executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    }

    #[test]
    fn duplicate_name_rejected() {
        let (executor, pipeline) = new_test_pipeline();
        pipeline.add_last("h", Box::new(CountingHandler(Arc::new(AtomicUsize::new(0))))).unwrap();
        let err = pipeline
            .add_last("h", Box::new(CountingHandler(Arc::new(AtomicUsize::new(0)))))
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateName(_)));
        executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let (executor, pipeline) = new_test_pipeline();
        pipeline.add_last("a", Box::new(CountingHandler(Arc::new(AtomicUsize::new(0))))).unwrap();
        pipeline.add_last("b", Box::new(CountingHandler(Arc::new(AtomicUsize::new(0))))).unwrap();
        pipeline.add_last("c", Box::new(CountingHandler(Arc::new(AtomicUsize::new(0))))).unwrap();
        pipeline.remove("b").unwrap();
        assert_eq!(pipeline.handler_names(), vec!["a".to_string(), "c".to_string()]);
        executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    }
}
