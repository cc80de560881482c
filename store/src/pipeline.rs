//! Per-store key and value transform pipeline.
//!
//! Three transforms stack transparently on the write path and invert
//! symmetrically on the read path:
//!
//! ```text
//! physical_key   = key_prefix || logical_key
//! physical_value = compress(empty_encode(logical_value))
//! ```
//!
//! The empty-value encoder is a value-space transform, not a storage hack at
//! the row layer; backends never see the distinction.

use bytes::{BufMut, Bytes, BytesMut};

use crate::compression::Compressor;
use crate::error::{Error, Result};

/// Sentinel byte appended to every value when the encoding is active.
///
/// An empty input becomes a single sentinel byte, which distinguishes
/// "exists and empty" from "missing" on engines that reject empty values.
pub const EMPTY_VALUE_SENTINEL: u8 = 0x00;

/// How a store treats empty values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyValuePolicy {
    /// The engine stores empty values natively; pass them through.
    Native,
    /// The engine rejects empty values and the store is not opted in;
    /// `put` of an empty value fails.
    Reject,
    /// The engine rejects empty values but the store is opted in; append
    /// one sentinel byte on write and strip one trailing byte on read.
    Encode,
}

/// The composed per-store transform.
#[derive(Debug, Clone)]
pub struct Pipeline {
    key_prefix: Bytes,
    compressor: Compressor,
    empty_values: EmptyValuePolicy,
}

impl Pipeline {
    pub fn new(key_prefix: Bytes, compressor: Compressor, empty_values: EmptyValuePolicy) -> Self {
        Self {
            key_prefix,
            compressor,
            empty_values,
        }
    }

    /// A pipeline that leaves keys and values untouched.
    pub fn passthrough() -> Self {
        Self::new(Bytes::new(), Compressor::NoOp, EmptyValuePolicy::Native)
    }

    pub fn key_prefix(&self) -> &Bytes {
        &self.key_prefix
    }

    /// `prefix || logical`. The logical key exposed to callers is never
    /// prefixed; the physical key in the backend always is.
    pub fn physical_key(&self, logical: &[u8]) -> Bytes {
        if self.key_prefix.is_empty() {
            return Bytes::copy_from_slice(logical);
        }
        let mut buf = BytesMut::with_capacity(self.key_prefix.len() + logical.len());
        buf.extend_from_slice(&self.key_prefix);
        buf.extend_from_slice(logical);
        buf.freeze()
    }

    /// Strips the prefix back off a physical key.
    pub fn logical_key(&self, physical: Bytes) -> Bytes {
        if self.key_prefix.is_empty() {
            return physical;
        }
        physical.slice(self.key_prefix.len()..)
    }

    /// Applies the empty-value policy, then compression.
    pub fn encode_value(&self, value: Bytes) -> Result<Bytes> {
        let value = match self.empty_values {
            EmptyValuePolicy::Native => value,
            EmptyValuePolicy::Reject => {
                if value.is_empty() {
                    return Err(Error::EmptyValueRejected);
                }
                value
            }
            EmptyValuePolicy::Encode => {
                let mut buf = BytesMut::with_capacity(value.len() + 1);
                buf.extend_from_slice(&value);
                buf.put_u8(EMPTY_VALUE_SENTINEL);
                buf.freeze()
            }
        };
        self.compressor.compress(value)
    }

    /// Decompresses, then strips the sentinel when the encoding is active.
    pub fn decode_value(&self, value: Bytes) -> Result<Bytes> {
        let value = self.compressor.decompress(value)?;
        match self.empty_values {
            EmptyValuePolicy::Native | EmptyValuePolicy::Reject => Ok(value),
            EmptyValuePolicy::Encode => {
                if value.is_empty() {
                    return Err(Error::Internal(
                        "sentinel-encoded value is missing its trailing byte".to_string(),
                    ));
                }
                Ok(value.slice(..value.len() - 1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_prefix_and_strip_keys() {
        // given
        let pipeline = Pipeline::new(
            Bytes::from_static(b"t;"),
            Compressor::NoOp,
            EmptyValuePolicy::Native,
        );

        // when
        let physical = pipeline.physical_key(b"user:1");

        // then
        assert_eq!(physical, Bytes::from_static(b"t;user:1"));
        assert_eq!(pipeline.logical_key(physical), Bytes::from_static(b"user:1"));
    }

    #[test]
    fn should_leave_keys_alone_without_prefix() {
        let pipeline = Pipeline::passthrough();
        let physical = pipeline.physical_key(b"user:1");
        assert_eq!(physical, Bytes::from_static(b"user:1"));
        assert_eq!(pipeline.logical_key(physical), Bytes::from_static(b"user:1"));
    }

    #[test]
    fn should_reject_empty_value_when_not_opted_in() {
        let pipeline = Pipeline::new(Bytes::new(), Compressor::NoOp, EmptyValuePolicy::Reject);
        assert_eq!(
            pipeline.encode_value(Bytes::new()),
            Err(Error::EmptyValueRejected)
        );
        assert!(pipeline.encode_value(Bytes::from("x")).is_ok());
    }

    #[test]
    fn should_roundtrip_empty_value_through_sentinel() {
        // given
        let pipeline = Pipeline::new(Bytes::new(), Compressor::NoOp, EmptyValuePolicy::Encode);

        // when
        let stored = pipeline.encode_value(Bytes::new()).unwrap();

        // then: a single sentinel byte distinguishes empty from missing
        assert_eq!(stored, Bytes::from_static(&[EMPTY_VALUE_SENTINEL]));
        assert_eq!(pipeline.decode_value(stored).unwrap(), Bytes::new());
    }

    #[test]
    fn should_roundtrip_nonempty_value_through_sentinel() {
        let pipeline = Pipeline::new(Bytes::new(), Compressor::NoOp, EmptyValuePolicy::Encode);
        let stored = pipeline.encode_value(Bytes::from("data")).unwrap();
        assert_eq!(stored, Bytes::from_static(b"data\x00"));
        assert_eq!(pipeline.decode_value(stored).unwrap(), Bytes::from("data"));
    }

    #[test]
    fn should_apply_sentinel_before_compression() {
        // given: a threshold the sentinel-extended value exceeds
        let pipeline = Pipeline::new(
            Bytes::new(),
            Compressor::Zstd { threshold: 20 },
            EmptyValuePolicy::Encode,
        );
        let value = Bytes::from(vec![b'a'; 100]);

        // when
        let stored = pipeline.encode_value(value.clone()).unwrap();

        // then
        assert!(stored.starts_with(&crate::compression::ZSTD_MAGIC));
        assert_eq!(pipeline.decode_value(stored).unwrap(), value);
    }
}
