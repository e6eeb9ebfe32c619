//! Length-field frame decoder (spec §6.5 "Frame decoder (length-field
//! variant)"): `need-length -> need-body -> emit`, with `fail-fast`
//! selecting whether an over-length frame is reported as soon as its
//! length is known or only after its body has been skipped.

use super::{ByteToMessageDecoder, FrameError};
use crate::pipeline::Message;

/// When a frame is reported as too long relative to `fail-fast`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailFast {
    /// Report as soon as the declared length is known, then discard the
    /// body as it arrives.
    Immediately,
    /// Discard the body first, then report once the whole frame has been
    /// skipped.
    AfterSkipping,
}

enum State {
    NeedLength,
    Discarding { remaining: usize, reported: bool },
}

/// Decodes frames whose body length is carried in a fixed-width header
/// field: `[header][body]`, where the header's length field sits at
/// `length_offset` and is `length_bytes` wide (1, 2, 3, 4, or 8).
pub struct LengthFieldBasedFrameDecoder {
    max_frame: usize,
    length_offset: usize,
    length_bytes: usize,
    length_adjustment: i64,
    strip_bytes: usize,
    fail_fast: FailFast,
    state: State,
}

/// Builder mirroring the named parameters in spec §6.5.
pub struct LengthFieldBuilder {
    max_frame: usize,
    length_offset: usize,
    length_bytes: usize,
    length_adjustment: i64,
    strip_bytes: Option<usize>,
    fail_fast: FailFast,
}

impl LengthFieldBuilder {
    pub fn new(max_frame: usize, length_bytes: usize) -> Self {
        LengthFieldBuilder {
            max_frame,
            length_offset: 0,
            length_bytes,
            length_adjustment: 0,
            strip_bytes: None,
            fail_fast: FailFast::AfterSkipping,
        }
    }

    pub fn with_length_offset(mut self, offset: usize) -> Self {
        self.length_offset = offset;
        self
    }

    pub fn with_length_adjustment(mut self, adjustment: i64) -> Self {
        self.length_adjustment = adjustment;
        self
    }

    pub fn with_strip_bytes(mut self, strip: usize) -> Self {
        self.strip_bytes = Some(strip);
        self
    }

    pub fn with_fail_fast(mut self, mode: FailFast) -> Self {
        self.fail_fast = mode;
        self
    }

    pub fn build(self) -> LengthFieldBasedFrameDecoder {
        // Netty's own default: strip the header (offset + length field),
        // leaving just the body, unless the caller asked for something else.
        let strip_bytes = self.strip_bytes.unwrap_or(self.length_offset + self.length_bytes);
        LengthFieldBasedFrameDecoder {
            max_frame: self.max_frame,
            length_offset: self.length_offset,
            length_bytes: self.length_bytes,
            length_adjustment: self.length_adjustment,
            strip_bytes,
            fail_fast: self.fail_fast,
            state: State::NeedLength,
        }
    }
}

fn read_length_be(bytes: &[u8]) -> Result<u64, FrameError> {
    match bytes.len() {
        1 => Ok(bytes[0] as u64),
        2 => Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as u64),
        3 => Ok(((bytes[0] as u64) << 16) | ((bytes[1] as u64) << 8) | (bytes[2] as u64)),
        4 => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64),
        8 => Ok(u64::from_be_bytes(bytes.try_into().unwrap())),
        n => Err(FrameError::MalformedHeader(format!("unsupported length field width {n}"))),
    }
}

impl ByteToMessageDecoder for LengthFieldBasedFrameDecoder {
    fn decode(&mut self, buf: &mut Vec<u8>) -> Result<Option<Message>, FrameError> {
        loop {
            match self.state {
                State::Discarding { remaining, reported } => {
                    let n = remaining.min(buf.len());
                    buf.drain(..n);
                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = State::Discarding { remaining, reported };
                        return Ok(None);
                    }
                    self.state = State::NeedLength;
                    if !reported {
                        return Err(FrameError::FrameTooLong {
                            length: 0,
                            max: self.max_frame,
                        });
                    }
                    // already reported on the way in; keep decoding the rest
                    // of what's buffered.
                }
                State::NeedLength => {
                    let header_end = self.length_offset + self.length_bytes;
                    if buf.len() < header_end {
                        return Ok(None);
                    }
                    let value = read_length_be(&buf[self.length_offset..header_end])?;
                    let frame_length = value as i64 + self.length_adjustment + header_end as i64;
                    if frame_length < 0 {
                        return Err(FrameError::MalformedHeader(format!(
                            "computed negative frame length ({frame_length})"
                        )));
                    }
                    let frame_length = frame_length as usize;

                    if frame_length > self.max_frame {
                        let have = buf.len();
                        match self.fail_fast {
                            FailFast::Immediately => {
                                let to_discard = frame_length.saturating_sub(have);
                                buf.clear();
                                self.state = if to_discard > 0 {
                                    State::Discarding {
                                        remaining: to_discard,
                                        reported: true,
                                    }
                                } else {
                                    State::NeedLength
                                };
                                return Err(FrameError::FrameTooLong {
                                    length: frame_length,
                                    max: self.max_frame,
                                });
                            }
                            FailFast::AfterSkipping => {
                                let to_discard_now = frame_length.min(have);
                                buf.drain(..to_discard_now);
                                let remaining = frame_length - to_discard_now;
                                if remaining > 0 {
                                    self.state = State::Discarding {
                                        remaining,
                                        reported: false,
                                    };
                                    return Ok(None);
                                }
                                self.state = State::NeedLength;
                                return Err(FrameError::FrameTooLong {
                                    length: frame_length,
                                    max: self.max_frame,
                                });
                            }
                        }
                    }

                    if buf.len() < frame_length {
                        return Ok(None);
                    }
                    let frame: Vec<u8> = buf.drain(..frame_length).collect();
                    let strip = self.strip_bytes.min(frame.len());
                    return Ok(Some(Box::new(frame[strip..].to_vec())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_recovery_reports_then_resumes() {
        let mut decoder = LengthFieldBuilder::new(5, 4).with_fail_fast(FailFast::AfterSkipping).build();

        let mut buf = vec![0x00, 0x00, 0x00, 0x02];
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&[0x00, 0x00]);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLong { .. }));

        buf.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(*frame.downcast::<Vec<u8>>().unwrap(), vec![0x41]);
    }

    #[test]
    fn strip_bytes_and_no_adjustment() {
        let mut decoder = LengthFieldBuilder::new(64, 2).with_strip_bytes(2).build();
        let mut buf = vec![0x00, 0x05, b'H', b'E', b'L', b'L', b'O'];
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(*frame.downcast::<Vec<u8>>().unwrap(), b"HELLO".to_vec());
    }
}
