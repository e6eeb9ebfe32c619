//! Flow-control handler (spec §6.5 "Channel pool" sibling contract, driven
//! by §4.3 auto-read/back-pressure and exercised by §8 scenario 3): turns
//! `read()` demand from downstream into delivery credits against whatever
//! has already been decoded, rather than letting every decoded message
//! through unconditionally.

use std::collections::VecDeque;

use crate::pipeline::{ChannelHandler, ChannelHandlerContext, HandlerMask, Message};

/// Gates inbound message delivery behind explicit `read()` calls when
/// `auto_read` is off. Each `read()` grants one credit; a message is only
/// fired downstream once a credit is available, queuing the rest.
pub struct FlowControlHandler {
    auto_read: bool,
    pending: VecDeque<Message>,
    credits: usize,
}

impl FlowControlHandler {
    pub fn new(auto_read: bool) -> Self {
        FlowControlHandler {
            auto_read,
            pending: VecDeque::new(),
            credits: 0,
        }
    }

    fn drain(&mut self, ctx: &ChannelHandlerContext) {
        while self.credits > 0 {
            match self.pending.pop_front() {
                Some(msg) => {
                    self.credits -= 1;
                    ctx.fire_channel_read(msg);
                }
                None => break,
            }
        }
    }
}

impl ChannelHandler for FlowControlHandler {
    fn mask(&self) -> HandlerMask {
        HandlerMask::CHANNEL_READ | HandlerMask::READ
    }

    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        if self.auto_read {
            ctx.fire_channel_read(msg);
            return;
        }
        self.pending.push_back(msg);
        self.drain(ctx);
    }

    /// Demand from downstream is satisfied out of what's already buffered;
    /// it is not forwarded further upstream, since converting pull-based
    /// demand into push is exactly this handler's job.
    fn read(&mut self, ctx: &ChannelHandlerContext) {
        if self.auto_read {
            ctx.read();
            return;
        }
        self.credits += 1;
        self.drain(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, ChannelPromise};
    use crate::executor::{ExecutorConfig, SingleThreadExecutor};
    use crate::pipeline::ChannelOps;
    use std::sync::{Arc, Mutex};

    struct NoopOps;
    impl ChannelOps for NoopOps {
        fn do_bind(&self, _: std::net::SocketAddr, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_connect(&self, _: std::net::SocketAddr, promise: ChannelPromise<ChannelError>) {
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
        fn do_write(&self, _: Message, promise: ChannelPromise<ChannelError>) {
            promise.succeed();
        }
        fn do_flush(&self) {}
    }

    struct CountingSink(Arc<Mutex<usize>>);
    impl ChannelHandler for CountingSink {
        fn mask(&self) -> HandlerMask {
            HandlerMask::CHANNEL_READ
        }
        fn channel_read(&mut self, _ctx: &ChannelHandlerContext, _msg: Message) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn exactly_n_reads_release_exactly_n_messages() {
        use crate::pipeline::ChannelPipeline;

        let executor = Arc::new(SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1)));
        let ops: Arc<dyn ChannelOps> = Arc::new(NoopOps);
        let pipeline = ChannelPipeline::new(Arc::clone(&executor), Arc::downgrade(&ops));

        let count = Arc::new(Mutex::new(0usize));
        pipeline.add_last("flow", Box::new(FlowControlHandler::new(false))).unwrap();
        pipeline
            .add_last("sink", Box::new(CountingSink(Arc::clone(&count))))
            .unwrap();

        let count2 = Arc::clone(&count);
        executor
            .submit(move || {
                for _ in 0..3 {
                    pipeline.fire_channel_read(Box::new(1u8));
                }
                assert_eq!(*count2.lock().unwrap(), 0);
                for _ in 0..3 {
                    pipeline.read();
                }
                assert_eq!(*count2.lock().unwrap(), 3);
                pipeline.fire_channel_read(Box::new(1u8));
                assert_eq!(*count2.lock().unwrap(), 3);
                pipeline.read();
                assert_eq!(*count2.lock().unwrap(), 4);
            })
            .wait()
            .unwrap();

        executor.shutdown_gracefully(std::time::Duration::from_millis(0), std::time::Duration::from_secs(1));
    }
}
