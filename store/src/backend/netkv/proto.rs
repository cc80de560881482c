//! Wire messages for the netkv protocol.
//!
//! Requests and stream frames are binary protobuf; the message structs are
//! written by hand rather than generated, so the crate builds without a
//! protoc toolchain.

use prost::Message;

/// A single key-value pair. Single-key `BatchGet` responses omit the key
/// for wire economy.
#[derive(Clone, PartialEq, Message)]
pub struct KeyValue {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: bytes::Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: bytes::Bytes,
}

/// Request body for `BatchPut`.
#[derive(Clone, PartialEq, Message)]
pub struct KeyValues {
    #[prost(message, repeated, tag = "1")]
    pub kvs: Vec<KeyValue>,
}

/// Request body for `BatchGet` and `BatchDelete`.
#[derive(Clone, PartialEq, Message)]
pub struct Keys {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub keys: Vec<bytes::Bytes>,
}

/// Read options carried by scan-shaped requests.
#[derive(Clone, PartialEq, Message)]
pub struct ReadOptions {
    #[prost(bool, tag = "1")]
    pub key_only: bool,
}

/// Request body for `Scan`.
#[derive(Clone, PartialEq, Message)]
pub struct ScanRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub start: bytes::Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub exclusive_end: bytes::Bytes,
    #[prost(uint64, tag = "3")]
    pub limit: u64,
    #[prost(message, optional, tag = "4")]
    pub options: Option<ReadOptions>,
}

/// Request body for `Prefix`.
#[derive(Clone, PartialEq, Message)]
pub struct PrefixRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub prefix: bytes::Bytes,
    #[prost(uint64, tag = "2")]
    pub limit: u64,
    #[prost(message, optional, tag = "3")]
    pub options: Option<ReadOptions>,
}

/// Request body for `BatchPrefix`.
///
/// The field keeps its historical wire name; the server applies it as the
/// global cap across all prefixes, like every other limit.
#[derive(Clone, PartialEq, Message)]
pub struct BatchPrefixRequest {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub prefixes: Vec<bytes::Bytes>,
    #[prost(uint64, tag = "2")]
    pub limit_per_prefix: u64,
    #[prost(message, optional, tag = "3")]
    pub options: Option<ReadOptions>,
}

/// One frame of a streaming response: either an item or a terminal error.
#[derive(Clone, PartialEq, Message)]
pub struct KvFrame {
    #[prost(message, optional, tag = "1")]
    pub kv: Option<KeyValue>,
    #[prost(uint32, tag = "2")]
    pub error_code: u32,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

/// Stream error codes carried in [`KvFrame::error_code`]. Zero means none.
pub mod error_code {
    pub const NONE: u32 = 0;
    pub const NOT_FOUND: u32 = 1;
    pub const INVALID_ARGUMENT: u32 = 2;
    pub const CANCELED: u32 = 3;
    pub const EMPTY_VALUE: u32 = 4;
    pub const STORAGE: u32 = 5;
    pub const INTERNAL: u32 = 6;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_encode_and_decode_scan_request() {
        // given
        let request = ScanRequest {
            start: bytes::Bytes::from("a"),
            exclusive_end: bytes::Bytes::from("z"),
            limit: 25,
            options: Some(ReadOptions { key_only: true }),
        };

        // when
        let encoded = request.encode_to_vec();
        let decoded = ScanRequest::decode(encoded.as_slice()).unwrap();

        // then
        assert_eq!(decoded.start, bytes::Bytes::from("a"));
        assert_eq!(decoded.exclusive_end, bytes::Bytes::from("z"));
        assert_eq!(decoded.limit, 25);
        assert!(decoded.options.unwrap().key_only);
    }

    #[test]
    fn should_encode_and_decode_key_values() {
        // given
        let body = KeyValues {
            kvs: vec![KeyValue {
                key: bytes::Bytes::from("k"),
                value: bytes::Bytes::from("v"),
            }],
        };

        // when
        let decoded = KeyValues::decode(body.encode_to_vec().as_slice()).unwrap();

        // then
        assert_eq!(decoded.kvs.len(), 1);
        assert_eq!(decoded.kvs[0].key, bytes::Bytes::from("k"));
        assert_eq!(decoded.kvs[0].value, bytes::Bytes::from("v"));
    }

    #[test]
    fn should_encode_and_decode_error_frame() {
        // given
        let frame = KvFrame {
            kv: None,
            error_code: error_code::NOT_FOUND,
            error_message: "key not found".to_string(),
        };

        // when
        let decoded = KvFrame::decode(frame.encode_to_vec().as_slice()).unwrap();

        // then
        assert_eq!(decoded.error_code, error_code::NOT_FOUND);
        assert_eq!(decoded.error_message, "key not found");
        assert!(decoded.kv.is_none());
    }
}
