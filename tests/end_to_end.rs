//! Black-box end-to-end scenarios built on `EmbeddedChannel` (spec §8,
//! SPEC_FULL.md §6.10).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weavecore::buf::{ByteBuf, ByteBufAllocator, PoolConfig, PooledByteBufAllocator, UnpooledByteBufAllocator};
use weavecore::channel::embedded::EmbeddedChannel;
use weavecore::channel::{Channel, ChannelConfig, WaterMark};
use weavecore::codec::{
    ByteToMessageDecoder, DecoderHandler, FailFast, FlowControlHandler, FrameError, LengthFieldBuilder,
};
use weavecore::executor::{ExecutorConfig, SingleThreadExecutor};
use weavecore::pipeline::{ChannelHandler, ChannelHandlerContext, HandlerMask, Message};

fn unpooled() -> Arc<dyn ByteBufAllocator> {
    Arc::new(UnpooledByteBufAllocator::new())
}

fn one_worker() -> Arc<SingleThreadExecutor> {
    Arc::new(SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1)))
}

// Scenario 1: pipeline add-during-read.
struct AddsPeerOnFirstRead {
    added: bool,
    peer_count: Arc<AtomicUsize>,
}
struct CountAndForward(Arc<AtomicUsize>);
impl ChannelHandler for CountAndForward {
    fn mask(&self) -> HandlerMask {
        HandlerMask::CHANNEL_READ
    }
    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        self.0.fetch_add(1, Ordering::SeqCst);
        ctx.fire_channel_read(msg);
    }
}
impl ChannelHandler for AddsPeerOnFirstRead {
    fn mask(&self) -> HandlerMask {
        HandlerMask::CHANNEL_READ
    }
    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        if !self.added {
            self.added = true;
            ctx.pipeline()
                .add_after("h0", "h2", Box::new(CountAndForward(Arc::clone(&self.peer_count))))
                .unwrap();
        }
        ctx.fire_channel_read(msg);
    }
}

#[test]
fn pipeline_add_during_read_observes_new_handler_next_message() {
    let executor = one_worker();
    let peer_count = Arc::new(AtomicUsize::new(0));
    let config = ChannelConfig::new(unpooled());
    let channel = EmbeddedChannel::new(
        Arc::clone(&executor),
        config,
        vec![Box::new(AddsPeerOnFirstRead {
            added: false,
            peer_count: Arc::clone(&peer_count),
        })],
    );

    // H1 adds H2 right after itself, then re-fires the same message from its
    // own context. Since linking happens synchronously before the re-fire,
    // the lazily-resolved next hop already includes H2 — it observes this
    // first message too, not just subsequent ones.
    let ch = Arc::clone(&channel);
    executor
        .submit(move || {
            ch.register();
            ch.write_inbound(Box::new(b"one".to_vec()));
        })
        .wait()
        .unwrap();
    assert_eq!(peer_count.load(Ordering::SeqCst), 1);

    let ch = Arc::clone(&channel);
    executor
        .submit(move || ch.write_inbound(Box::new(b"two".to_vec())))
        .wait()
        .unwrap();
    assert_eq!(peer_count.load(Ordering::SeqCst), 2);

    executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
}

// Scenario 2: framing recovery.
#[test]
fn framing_recovery_reports_over_length_then_resumes() {
    let mut decoder = LengthFieldBuilder::new(5, 4).with_fail_fast(FailFast::AfterSkipping).build();

    let mut errors = Vec::new();
    let mut frames: Vec<Vec<u8>> = Vec::new();
    let mut feed = |decoder: &mut dyn ByteToMessageDecoder, cumulation: &mut Vec<u8>, chunk: &[u8]| {
        cumulation.extend_from_slice(chunk);
        loop {
            match decoder.decode(cumulation) {
                Ok(Some(msg)) => frames.push(*msg.downcast::<Vec<u8>>().unwrap()),
                Ok(None) => break,
                Err(e) => {
                    errors.push(e);
                    break;
                }
            }
        }
    };

    let mut cumulation = Vec::new();
    feed(&mut decoder, &mut cumulation, &[0x00, 0x00, 0x00, 0x02]);
    feed(&mut decoder, &mut cumulation, &[0x00, 0x00]);
    feed(&mut decoder, &mut cumulation, &[0x00, 0x00, 0x00, 0x01, 0x41]);

    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], FrameError::FrameTooLong { .. }));
    assert_eq!(frames, vec![vec![0x41]]);
}

// Scenario 3: back-pressure via FlowControlHandler, driven off a decoder
// that turns one byte into three messages.
struct TripleDecoder;
impl ByteToMessageDecoder for TripleDecoder {
    fn decode(&mut self, cumulation: &mut Vec<u8>) -> Result<Option<Message>, FrameError> {
        if cumulation.is_empty() {
            return Ok(None);
        }
        cumulation.remove(0);
        Ok(Some(Box::new(1u8)))
    }
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
fn back_pressure_releases_exactly_n_messages_per_n_reads() {
    let executor = one_worker();
    let config = ChannelConfig::new(unpooled()).with_auto_read(false);
    let count = Arc::new(Mutex::new(0usize));
    let channel = EmbeddedChannel::new(
        Arc::clone(&executor),
        config,
        vec![
            Box::new(DecoderHandler::new(TripleDecoder)),
            Box::new(FlowControlHandler::new(false)),
            Box::new(CountingSink(Arc::clone(&count))),
        ],
    );

    let ch = Arc::clone(&channel);
    let count2 = Arc::clone(&count);
    executor
        .submit(move || {
            ch.register();
            ch.write_inbound(Box::new(vec![1u8, 2, 3]));
            assert_eq!(*count2.lock().unwrap(), 0);
            for _ in 0..3 {
                ch.read();
            }
            assert_eq!(*count2.lock().unwrap(), 3);
            ch.read();
            assert_eq!(*count2.lock().unwrap(), 3);
        })
        .wait()
        .unwrap();

    executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
}

// Scenario 4: writability edge.
struct ObserveWritability(Arc<Mutex<Vec<bool>>>);
impl ChannelHandler for ObserveWritability {
    fn mask(&self) -> HandlerMask {
        HandlerMask::WRITABILITY_CHANGED
    }
    fn writability_changed(&mut self, ctx: &ChannelHandlerContext, writable: bool) {
        self.0.lock().unwrap().push(writable);
        ctx.fire_writability_changed(writable);
    }
}

#[test]
fn writability_edge_surfaces_exactly_once_per_crossing() {
    let executor = one_worker();
    let config = ChannelConfig::new(unpooled()).with_water_mark(WaterMark { low: 32, high: 64 });
    let edges = Arc::new(Mutex::new(Vec::new()));
    let channel = EmbeddedChannel::new(
        Arc::clone(&executor),
        config,
        vec![Box::new(ObserveWritability(Arc::clone(&edges)))],
    );

    let ch = Arc::clone(&channel);
    let edges2 = Arc::clone(&edges);
    executor
        .submit(move || {
            ch.register();
            assert!(ch.is_writable());
            ch.write(Box::new(vec![0u8; 80]));
            assert!(!ch.is_writable());
            assert_eq!(*edges2.lock().unwrap(), vec![false]);
            ch.flush();
            assert!(ch.is_writable());
            assert_eq!(*edges2.lock().unwrap(), vec![false, true]);
        })
        .wait()
        .unwrap();

    executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
}

// Scenario 5: pool lifetime.
#[test]
fn pool_lifetime_returns_to_baseline_with_no_leaks() {
    use rand::seq::SliceRandom;
    use weavecore::buf::LeakDetectionLevel;

    let config = PoolConfig {
        arena_count: 4,
        leak_detection_level: LeakDetectionLevel::Paranoid,
        ..PoolConfig::default()
    };
    let pool = Arc::new(PooledByteBufAllocator::new(config));
    let baseline = pool.bytes_in_use();

    let executors: Vec<Arc<SingleThreadExecutor>> = (0..4)
        .map(|_| Arc::new(SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1))))
        .collect();

    let mut handles = Vec::new();
    for executor in &executors {
        let pool = Arc::clone(&pool);
        handles.push(executor.submit(move || {
            let mut bufs: Vec<ByteBuf> = (0..2_500).map(|_| pool.allocate(256, 256).unwrap()).collect();
            let mut rng = rand::thread_rng();
            bufs.shuffle(&mut rng);
            for buf in bufs.iter() {
                buf.release(1).unwrap();
            }
            pool.trim_current_thread_cache();
        }));
    }
    for handle in handles {
        handle.wait().unwrap();
    }

    for executor in &executors {
        executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    }

    assert_eq!(pool.bytes_in_use(), baseline);
    assert!(pool.leak_report().is_empty());
}

// Scenario 6: graceful shutdown cancels a long-pending scheduled task.
#[test]
fn graceful_shutdown_cancels_pending_scheduled_task_within_timeout() {
    let executor = SingleThreadExecutor::new(ExecutorConfig::default().with_worker_count(1));
    let scheduled = executor.schedule(Duration::from_secs(24 * 60 * 60), || {});

    let started = std::time::Instant::now();
    executor.shutdown_gracefully(Duration::from_millis(0), Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));

    let err = scheduled.job().wait().unwrap_err();
    assert!(matches!(err, weavecore::executor::ExecutorError::Cancelled));
}

// Scenario 7: strip-bytes and length-adjustment.
#[test]
fn strip_bytes_and_length_adjustment_emits_bare_body() {
    let mut decoder = LengthFieldBuilder::new(64, 2).with_strip_bytes(2).build();
    let mut cumulation = vec![0x00, 0x05, b'H', b'E', b'L', b'L', b'O'];
    let frame = decoder.decode(&mut cumulation).unwrap().unwrap();
    assert_eq!(*frame.downcast::<Vec<u8>>().unwrap(), b"HELLO".to_vec());
    assert!(cumulation.is_empty());
}
