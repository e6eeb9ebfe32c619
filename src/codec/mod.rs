//! Codec handlers: the three roles spec'd for anything sitting between raw
//! bytes and application messages (§6.2) — byte-to-message decoding with a
//! cumulative inbound buffer, message-to-byte encoding, and pure
//! message-to-message transforms — plus the length-field frame decoder and
//! flow-control handler named as collaborator contracts (§6.5).

mod flow_control;
mod length_field;

pub use flow_control::FlowControlHandler;
pub use length_field::{FailFast, LengthFieldBasedFrameDecoder, LengthFieldBuilder};

use thiserror::Error;

use crate::buf::ByteBuf;
use crate::channel::{ChannelError, ChannelPromise};
use crate::pipeline::{ChannelHandler, ChannelHandlerContext, HandlerMask, Message, PipelineError};

/// Errors raised by frame decoding (spec §7 kind 4).
#[derive(Debug, Error, Clone)]
pub enum FrameError {
    #[error("frame length {length} exceeds configured maximum {max}")]
    FrameTooLong { length: usize, max: usize },
    #[error("malformed frame header: {0}")]
    MalformedHeader(String),
}

/// Extracts the bytes carried by a pipeline message, recognizing the two
/// byte-container shapes this core hands between handlers.
fn take_bytes(msg: Message) -> Vec<u8> {
    if let Ok(buf) = msg.downcast::<ByteBuf>() {
        let mut buf = *buf;
        let len = buf.readable_bytes();
        return buf.read_bytes(len).unwrap_or_default();
    }
    if let Ok(bytes) = msg.downcast::<Vec<u8>>() {
        return *bytes;
    }
    Vec::new()
}

/// A byte-to-message decoder (§6.2 role a): attempts to decode one frame
/// out of the front of `cumulation`, returning `Ok(None)` when more input
/// is needed. `cumulation` persists across calls and across reads.
pub trait ByteToMessageDecoder: Send {
    fn decode(&mut self, cumulation: &mut Vec<u8>) -> Result<Option<Message>, FrameError>;
}

/// Adapts a [`ByteToMessageDecoder`] into a pipeline handler: appends each
/// inbound chunk to the cumulative buffer, then decodes frames out of it in
/// a loop until the decoder reports it needs more data.
pub struct DecoderHandler<D> {
    decoder: D,
    cumulation: Vec<u8>,
}

impl<D: ByteToMessageDecoder> DecoderHandler<D> {
    pub fn new(decoder: D) -> Self {
        DecoderHandler {
            decoder,
            cumulation: Vec::new(),
        }
    }
}

impl<D: ByteToMessageDecoder> ChannelHandler for DecoderHandler<D> {
    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        self.cumulation.extend_from_slice(&take_bytes(msg));
        loop {
            match self.decoder.decode(&mut self.cumulation) {
                Ok(Some(frame)) => ctx.fire_channel_read(frame),
                Ok(None) => break,
                Err(e) => {
                    ctx.fire_exception_caught(PipelineError::Other(e.to_string()));
                    break;
                }
            }
        }
    }
}

/// A message-to-byte encoder (§6.2 role b): turns one outbound message into
/// its wire bytes.
pub trait MessageToByteEncoder: Send {
    fn encode(&mut self, msg: Message) -> Result<Vec<u8>, FrameError>;
}

/// Adapts a [`MessageToByteEncoder`] into a pipeline handler sitting on the
/// outbound (write) side.
pub struct EncoderHandler<E> {
    encoder: E,
}

impl<E: MessageToByteEncoder> EncoderHandler<E> {
    pub fn new(encoder: E) -> Self {
        EncoderHandler { encoder }
    }
}

impl<E: MessageToByteEncoder> ChannelHandler for EncoderHandler<E> {
    fn mask(&self) -> HandlerMask {
        HandlerMask::WRITE
    }
    fn write(&mut self, ctx: &ChannelHandlerContext, msg: Message, promise: ChannelPromise<ChannelError>) {
        match self.encoder.encode(msg) {
            Ok(bytes) => ctx.write(Box::new(bytes), promise),
            Err(e) => {
                ctx.fire_exception_caught(PipelineError::Other(e.to_string()));
                promise.fail(ChannelError::Io(e.to_string()));
            }
        }
    }
}

/// A pure message-to-message transform (§6.2 role c): no buffering, no
/// bytes, just one message in and one message out.
pub trait MessageTransform: Send {
    fn transform(&mut self, msg: Message) -> Message;
}

/// Adapts a [`MessageTransform`] into an inbound pipeline handler.
pub struct TransformHandler<T> {
    transform: T,
}

impl<T: MessageTransform> TransformHandler<T> {
    pub fn new(transform: T) -> Self {
        TransformHandler { transform }
    }
}

impl<T: MessageTransform> ChannelHandler for TransformHandler<T> {
    fn mask(&self) -> HandlerMask {
        HandlerMask::CHANNEL_READ
    }
    fn channel_read(&mut self, ctx: &ChannelHandlerContext, msg: Message) {
        ctx.fire_channel_read(self.transform.transform(msg));
    }
}
