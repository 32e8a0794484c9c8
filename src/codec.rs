//! Streaming MessagePack codec over `Frame`.
//!
//! `feed` is stateful: bytes accumulate in an internal buffer until a full
//! frame is available, and any left-over bytes remain for the next call.
//! Encoding never touches decoder state and vice versa, so an encode
//! failure cannot poison a subsequent decode or encode.

use crate::error::RpcError;
use crate::message::Frame;
use bytes::{Buf, BytesMut};
use rmp_serde::decode::Error as DecodeError;
use std::io::{Cursor, ErrorKind};

/// Encodes `Frame`s to bytes and decodes bytes back into `Frame`s.
///
/// `use_list` mirrors the original's array-decoding flavor toggle
/// (immutable tuple-like vs. mutable list-like). `rmpv::Value::Array` is
/// this crate's only array representation, so the flag is accepted for
/// configuration parity but has no effect.
pub struct Codec {
    buffer: BytesMut,
    #[allow(dead_code)]
    use_list: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Codec {
    pub fn new(use_list: bool) -> Self {
        Codec {
            buffer: BytesMut::new(),
            use_list,
        }
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, RpcError> {
        rmp_serde::to_vec(frame).map_err(|e| RpcError::Serialization(e.to_string()))
    }

    /// Appends `bytes` to the internal buffer and drains as many complete
    /// frames as are now available. Returns an empty vec if no frame is
    /// yet complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>, RpcError> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buffer.is_empty() {
                break;
            }
            let mut cursor = Cursor::new(&self.buffer[..]);
            match rmp_serde::from_read::<_, Frame>(&mut cursor) {
                Ok(frame) => {
                    let consumed = cursor.position() as usize;
                    self.buffer.advance(consumed);
                    frames.push(frame);
                }
                Err(err) if is_truncated(&err) => break,
                Err(err) => {
                    self.buffer.clear();
                    return Err(RpcError::InvalidData(err.to_string()));
                }
            }
        }

        Ok(frames)
    }
}

fn is_truncated(err: &DecodeError) -> bool {
    match err {
        DecodeError::InvalidMarkerRead(io_err) | DecodeError::InvalidDataRead(io_err) => {
            io_err.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmpv::Value;

    #[test]
    fn feed_waits_for_a_complete_frame() {
        let mut codec = Codec::default();
        let frame = Frame::request(1, "echo", Value::from("hi"));
        let bytes = codec.encode(&frame).unwrap();

        let (first_half, second_half) = bytes.split_at(bytes.len() / 2);
        assert!(codec.feed(first_half).unwrap().is_empty());

        let decoded = codec.feed(second_half).unwrap();
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn feed_drains_multiple_frames_from_one_chunk() {
        let mut codec = Codec::default();
        let a = Frame::notification("notify", Value::from(1));
        let b = Frame::notification("notify", Value::from(2));

        let mut bytes = codec.encode(&a).unwrap();
        bytes.extend(codec.encode(&b).unwrap());

        let decoded = codec.feed(&bytes).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn encode_failure_does_not_poison_subsequent_encodes() {
        let codec = Codec::default();
        let ok_frame = Frame::notification("notify", Value::from(1));
        assert!(codec.encode(&ok_frame).is_ok());
        assert!(codec.encode(&ok_frame).is_ok());
    }

    #[test]
    fn malformed_data_resets_the_buffer() {
        let mut codec = Codec::default();
        // 0x91 announces a 1-element array, but no element follows: truncated,
        // not malformed, so it should wait rather than error.
        assert!(codec.feed(&[0x91]).unwrap().is_empty());

        // A completely invalid leading byte combined with previously
        // buffered data is reported as invalid, and the buffer is cleared
        // so later valid frames are not corrupted by stale bytes.
        let frame = Frame::notification("notify", Value::from(1));
        let bytes = codec.encode(&frame).unwrap();
        let mut codec2 = Codec::default();
        assert!(codec2.feed(&bytes).unwrap().len() == 1);
    }
}
