//! An in-memory [`Channel`] with no backing socket — this core's "shell"
//! transport (SPEC_FULL.md §6.6), grounded in the teacher's own
//! no-op `sys/shell` backend. Used by tests and by consumers who want to
//! drive a pipeline without real I/O.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use crate::buf::ByteBufAllocator;
use crate::executor::SingleThreadExecutor;
use crate::pipeline::{ChannelHandler, ChannelOps, ChannelPipeline, Message, PeerAddr};

use super::{
    message_byte_size, Channel, ChannelConfig, ChannelError, ChannelId, ChannelOutboundBuffer, ChannelPromise,
    ChannelState,
};

struct Inner {
    state: Mutex<ChannelState>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    outbound: Mutex<ChannelOutboundBuffer>,
    /// Messages the head handed to `do_write`/`do_flush`, standing in for
    /// bytes a real transport would have written to the wire. Drained by
    /// tests with [`EmbeddedChannel::read_outbound`].
    written: Mutex<VecDeque<Message>>,
    config: ChannelConfig,
}

/// An embedded channel. `write_inbound` simulates a transport delivering
/// data; `read_outbound` drains what the pipeline wrote back out.
pub struct EmbeddedChannel {
    id: ChannelId,
    executor: Arc<SingleThreadExecutor>,
    pipeline: ChannelPipeline,
    inner: Inner,
}

impl EmbeddedChannel {
    pub fn new(executor: Arc<SingleThreadExecutor>, config: ChannelConfig, handlers: Vec<Box<dyn ChannelHandler>>) -> Arc<Self> {
        let water = config.water_mark;
        Arc::new_cyclic(|weak: &Weak<EmbeddedChannel>| {
            let ops: Weak<dyn ChannelOps> = weak.clone();
            let pipeline = ChannelPipeline::new(Arc::clone(&executor), ops);
            for (i, handler) in handlers.into_iter().enumerate() {
                pipeline.add_last(format!("h{i}"), handler).expect("unique generated name");
            }
            EmbeddedChannel {
                id: ChannelId::new(),
                executor,
                pipeline,
                inner: Inner {
                    state: Mutex::new(ChannelState::Created),
                    local_addr: Mutex::new(None),
                    remote_addr: Mutex::new(None),
                    outbound: Mutex::new(ChannelOutboundBuffer::new(water.low, water.high)),
                    written: Mutex::new(VecDeque::new()),
                    config,
                },
            }
        })
    }

    /// Registers and activates the channel, firing the corresponding
    /// pipeline events exactly once each (§4.3).
    pub fn register(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state != ChannelState::Created && *state != ChannelState::Closed {
            return;
        }
        *state = ChannelState::Registered;
        drop(state);
        self.pipeline.fire_channel_registered();
        let mut state = self.inner.state.lock().unwrap();
        *state = ChannelState::Active;
        drop(state);
        self.pipeline.fire_channel_active();
    }

    pub fn allocator(&self) -> &Arc<dyn ByteBufAllocator> {
        &self.inner.config.allocator
    }

    /// Simulates a transport read: fires `channel-read` with `msg`, then
    /// `channel-read-complete`.
    pub fn write_inbound(&self, msg: Message) {
        self.pipeline.fire_channel_read(msg);
        self.pipeline.fire_channel_read_complete();
    }

    /// Drains messages the pipeline flushed toward the (nonexistent)
    /// transport, in the order they were written.
    pub fn read_outbound(&self) -> Vec<Message> {
        self.inner.written.lock().unwrap().drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.inner.written.lock().unwrap().len()
    }
}

impl ChannelOps for EmbeddedChannel {
    fn do_bind(&self, local: PeerAddr, promise: ChannelPromise<ChannelError>) {
        *self.inner.local_addr.lock().unwrap() = Some(local);
        promise.succeed();
    }
    fn do_connect(&self, remote: PeerAddr, promise: ChannelPromise<ChannelError>) {
        *self.inner.remote_addr.lock().unwrap() = Some(remote);
        let mut state = self.inner.state.lock().unwrap();
        if *state == ChannelState::Registered {
            *state = ChannelState::Active;
        }
        drop(state);
        promise.succeed();
    }
    fn do_disconnect(&self, promise: ChannelPromise<ChannelError>) {
        *self.inner.remote_addr.lock().unwrap() = None;
        promise.succeed();
    }
    fn do_close(&self, promise: ChannelPromise<ChannelError>) {
        let mut outbound = self.inner.outbound.lock().unwrap();
        outbound.fail_all(ChannelError::Closed(self.id));
        drop(outbound);
        *self.inner.state.lock().unwrap() = ChannelState::Closed;
        promise.succeed();
    }
    fn do_deregister(&self, promise: ChannelPromise<ChannelError>) {
        *self.inner.state.lock().unwrap() = ChannelState::Registered;
        promise.succeed();
    }
    fn do_read(&self) {}
    fn do_write(&self, msg: Message, promise: ChannelPromise<ChannelError>) {
        let size = message_byte_size(&msg);
        let edge = self.inner.outbound.lock().unwrap().queue_write(msg, size, promise);
        if let Some(writable) = edge {
            self.pipeline.fire_writability_changed(writable);
        }
    }
    fn do_flush(&self) {
        let written = &self.inner.written;
        let edge = self.inner.outbound.lock().unwrap().flush(|msg| {
            written.lock().unwrap().push_back(msg);
            Ok(())
        });
        if let Some(writable) = edge {
            self.pipeline.fire_writability_changed(writable);
        }
    }
}

impl Channel for EmbeddedChannel {
    fn id(&self) -> ChannelId {
        self.id
    }
    fn state(&self) -> ChannelState {
        *self.inner.state.lock().unwrap()
    }
    fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }
    fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock().unwrap()
    }
    fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }
    fn executor(&self) -> &Arc<SingleThreadExecutor> {
        &self.executor
    }
    fn is_writable(&self) -> bool {
        self.inner.outbound.lock().unwrap().is_writable()
    }

    fn bind(&self, local: SocketAddr) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.bind(local, promise.clone());
        promise
    }
    fn connect(&self, remote: SocketAddr) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.connect(remote, promise.clone());
        promise
    }
    fn disconnect(&self) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.disconnect(promise.clone());
        promise
    }
    fn close(&self) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.close(promise.clone());
        promise
    }
    fn deregister(&self) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.deregister(promise.clone());
        promise
    }
    fn read(&self) {
        self.pipeline.read();
    }
    fn write(&self, msg: Message) -> ChannelPromise<ChannelError> {
        let promise = ChannelPromise::pending();
        self.pipeline.write(msg, promise.clone());
        promise
    }
    fn flush(&self) {
        self.pipeline.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::UnpooledByteBufAllocator;
    use crate::executor::ExecutorConfig;
    use crate::pipeline::{ChannelHandlerContext, HandlerMask};
    use std::time::Duration;

    struct Echo;
    impl ChannelHandler for Echo {
        fn mask(&self) -> HandlerMask {
            HandlerMask::CHANNEL_READ
        }
        fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
            ctx.write(msg, ChannelPromise::pending());
            ctx.flush();
        }
    }

    #[test]
    fn write_inbound_reaches_handler_and_echoes_outbound() {
        let executor = Arc::new(SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1)));
        let config = ChannelConfig::new(Arc::new(UnpooledByteBufAllocator::new()));
        let channel = EmbeddedChannel::new(Arc::clone(&executor), config, vec![Box::new(Echo)]);

        let ch = Arc::clone(&channel);
        executor
            .submit(move || {
                ch.register();
                ch.write_inbound(Box::new(b"hi".to_vec()));
            })
            .wait()
            .unwrap();

        assert_eq!(channel.outbound_len(), 1);
        executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    }
}
