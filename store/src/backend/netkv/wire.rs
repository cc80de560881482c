//! Length-delimited framing for netkv response streams.
//!
//! Each frame is a 4-byte big-endian length followed by one encoded
//! [`KvFrame`]. End-of-stream is the natural end of the HTTP body; a frame
//! with a non-zero error code is terminal.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;

use crate::error::{Error, Result};
use crate::model::Kv;

use super::proto::{error_code, KeyValue, KvFrame};

/// Frames larger than this are rejected as corrupt rather than buffered.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

pub fn encode_frame(frame: &KvFrame) -> Bytes {
    let body_len = frame.encoded_len();
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    frame
        .encode(&mut buf)
        .expect("BytesMut grows on demand, encoding cannot fail");
    buf.freeze()
}

/// Wraps an item for the stream.
pub fn item_frame(kv: Kv) -> KvFrame {
    KvFrame {
        kv: Some(KeyValue {
            key: kv.key,
            value: kv.value,
        }),
        error_code: error_code::NONE,
        error_message: String::new(),
    }
}

/// Wraps a terminal error for the stream.
pub fn error_frame(err: &Error) -> KvFrame {
    let code = match err {
        Error::NotFound => error_code::NOT_FOUND,
        Error::InvalidInput(_) => error_code::INVALID_ARGUMENT,
        Error::Canceled => error_code::CANCELED,
        Error::EmptyValueRejected => error_code::EMPTY_VALUE,
        Error::Storage(_) => error_code::STORAGE,
        Error::Internal(_) => error_code::INTERNAL,
    };
    KvFrame {
        kv: None,
        error_code: code,
        error_message: err.to_string(),
    }
}

/// Recovers the terminal error of a frame, if it carries one.
pub fn frame_error(frame: &KvFrame) -> Option<Error> {
    match frame.error_code {
        error_code::NONE => None,
        error_code::NOT_FOUND => Some(Error::NotFound),
        error_code::INVALID_ARGUMENT => Some(Error::InvalidInput(frame.error_message.clone())),
        error_code::CANCELED => Some(Error::Canceled),
        error_code::EMPTY_VALUE => Some(Error::EmptyValueRejected),
        error_code::STORAGE => Some(Error::Storage(frame.error_message.clone())),
        _ => Some(Error::Internal(frame.error_message.clone())),
    }
}

/// Incremental decoder over arbitrarily-chunked body bytes.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<KvFrame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if frame_len > MAX_FRAME_BYTES {
            return Err(Error::Storage(format!(
                "frame length {} exceeds maximum {}",
                frame_len, MAX_FRAME_BYTES
            )));
        }
        if self.buf.len() < 4 + frame_len {
            return Ok(None);
        }

        self.buf.advance(4);
        let body = self.buf.split_to(frame_len).freeze();
        let frame = KvFrame::decode(body)
            .map_err(|e| Error::Storage(format!("malformed stream frame: {}", e)))?;
        Ok(Some(frame))
    }

    /// True when no partial frame is left in the buffer.
    pub fn is_drained(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_decode_frames_split_across_chunks() {
        // given
        let frames: Vec<Bytes> = (0..3u8)
            .map(|n| encode_frame(&item_frame(Kv::new(vec![n], vec![n, n]))))
            .collect();
        let wire: Vec<u8> = frames.iter().flat_map(|f| f.to_vec()).collect();

        // when: fed one byte at a time
        let mut decoder = FrameDecoder::new();
        let mut decoded = Vec::new();
        for byte in wire {
            decoder.feed(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }

        // then
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[2].kv.as_ref().unwrap().key.as_ref(), &[2]);
        assert!(decoder.is_drained());
    }

    #[test]
    fn should_roundtrip_errors_through_frames() {
        for err in [
            Error::NotFound,
            Error::InvalidInput("bad".into()),
            Error::Canceled,
            Error::EmptyValueRejected,
            Error::Storage("boom".into()),
            Error::Internal("bug".into()),
        ] {
            let frame = error_frame(&err);
            assert_eq!(frame_error(&frame), Some(err));
        }
        assert_eq!(frame_error(&item_frame(Kv::new("k", "v"))), None);
    }

    #[test]
    fn should_reject_oversized_frame_length() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&u32::MAX.to_be_bytes());
        assert!(decoder.next_frame().is_err());
    }
}
