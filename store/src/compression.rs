//! Self-describing value compression.
//!
//! Compressed values carry zstd's native 4-byte magic, so decompression
//! sniffs the payload instead of trusting configuration. Data written under
//! an older "no compression" configuration decodes unchanged, and archives
//! that do contain compressed entries stay readable after compression is
//! turned off.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Leading bytes of a zstd frame.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Default size threshold, in bytes, below which values are stored
/// uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

/// Pluggable value compressor with a size threshold below which compression
/// is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compressor {
    NoOp,
    Zstd { threshold: usize },
}

impl Compressor {
    /// Builds a compressor from a DSN `compression` option value.
    ///
    /// The empty string maps to no-op for compatibility with DSNs written
    /// before the option existed.
    pub fn from_mode(mode: &str, threshold: usize) -> Result<Self> {
        match mode {
            "zst" | "zstd" => Ok(Compressor::Zstd { threshold }),
            "" | "none" | "false" | "no" => Ok(Compressor::NoOp),
            other => Err(Error::InvalidInput(format!(
                "invalid compression value {:?}, use 'none' or 'zstd'",
                other
            ))),
        }
    }

    /// Legacy mode for engines that compress natively: any valid mode
    /// decodes old compressed entries, but the write path never compresses
    /// because the threshold can never be exceeded.
    pub fn legacy(mode: &str) -> Result<Self> {
        Self::from_mode(mode, usize::MAX)
    }

    /// Returns the value verbatim at or below the threshold, otherwise a
    /// zstd frame.
    pub fn compress(&self, value: Bytes) -> Result<Bytes> {
        match self {
            Compressor::NoOp => Ok(value),
            Compressor::Zstd { threshold } => {
                if value.len() <= *threshold {
                    return Ok(value);
                }
                let compressed = zstd::stream::encode_all(value.as_ref(), 0)
                    .map_err(|e| Error::Internal(format!("zstd encode: {}", e)))?;
                Ok(Bytes::from(compressed))
            }
        }
    }

    /// Decompresses values carrying the magic prefix and passes everything
    /// else through verbatim, regardless of the configured mode.
    pub fn decompress(&self, value: Bytes) -> Result<Bytes> {
        if !value.starts_with(&ZSTD_MAGIC) {
            return Ok(value);
        }
        let decompressed = zstd::stream::decode_all(value.as_ref())
            .map_err(|e| Error::Storage(format!("zstd decode: {}", e)))?;
        Ok(Bytes::from(decompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_pass_small_values_through() {
        // given
        let compressor = Compressor::Zstd { threshold: 50 };
        let value = Bytes::from("short value");

        // when
        let out = compressor.compress(value.clone()).unwrap();

        // then
        assert_eq!(out, value);
    }

    #[test]
    fn should_compress_above_threshold_with_magic() {
        // given
        let compressor = Compressor::Zstd { threshold: 10 };
        let value = Bytes::from(vec![b'a'; 500]);

        // when
        let out = compressor.compress(value.clone()).unwrap();

        // then
        assert!(out.starts_with(&ZSTD_MAGIC));
        assert!(out.len() < value.len());
        assert_eq!(compressor.decompress(out).unwrap(), value);
    }

    #[test]
    fn should_roundtrip_any_value() {
        let compressor = Compressor::Zstd { threshold: 0 };
        for value in [
            Bytes::new(),
            Bytes::from("x"),
            Bytes::from(vec![0u8; 1000]),
        ] {
            let out = compressor.compress(value.clone()).unwrap();
            assert_eq!(compressor.decompress(out).unwrap(), value);
        }
    }

    #[test]
    fn should_decompress_even_in_noop_mode() {
        // given: an entry written while compression was enabled
        let writer = Compressor::Zstd { threshold: 0 };
        let stored = writer.compress(Bytes::from(vec![b'z'; 200])).unwrap();
        assert!(stored.starts_with(&ZSTD_MAGIC));

        // when: read back under a no-compression configuration
        let reader = Compressor::NoOp;
        let out = reader.decompress(stored).unwrap();

        // then
        assert_eq!(out, Bytes::from(vec![b'z'; 200]));
    }

    #[test]
    fn should_pass_unmagicked_values_through_on_decompress() {
        let compressor = Compressor::Zstd { threshold: 0 };
        let value = Bytes::from("plain stored value");
        assert_eq!(compressor.decompress(value.clone()).unwrap(), value);
    }

    #[test]
    fn should_parse_modes() {
        assert_eq!(Compressor::from_mode("", 10).unwrap(), Compressor::NoOp);
        assert_eq!(Compressor::from_mode("none", 10).unwrap(), Compressor::NoOp);
        assert_eq!(Compressor::from_mode("no", 10).unwrap(), Compressor::NoOp);
        assert_eq!(
            Compressor::from_mode("zstd", 10).unwrap(),
            Compressor::Zstd { threshold: 10 }
        );
        assert_eq!(
            Compressor::from_mode("zst", 10).unwrap(),
            Compressor::Zstd { threshold: 10 }
        );
        assert!(Compressor::from_mode("lz4", 10).is_err());
    }

    #[test]
    fn should_never_compress_in_legacy_mode() {
        let compressor = Compressor::legacy("zstd").unwrap();
        let value = Bytes::from(vec![b'a'; 100_000]);
        assert_eq!(compressor.compress(value.clone()).unwrap(), value);
    }
}
