//! Core data types: key-value records, keys, and iteration limits.

use bytes::{BufMut, Bytes, BytesMut};

/// An opaque key-value record.
///
/// Keys compare lexicographically. Values are opaque bytes; any transform
/// (compression, sentinel encoding) has already been inverted by the time a
/// `Kv` reaches a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: Bytes,
    pub value: Bytes,
}

impl Kv {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The size of a record is the sum of its key and value lengths.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// A byte key with a hex `Display`, used for logging and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key(pub Bytes);

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Key {
    /// Returns the next key in byte order: the input with `0x00` appended.
    ///
    /// Seeking from `next(k)` skips `k` itself but visits every key that has
    /// `k` as a proper prefix.
    pub fn next(&self) -> Bytes {
        key_next(&self.0)
    }

    /// Returns the smallest key greater than every key prefixed by this one,
    /// or `None` when no such key exists (empty or all-`0xFF` input).
    pub fn prefix_successor(&self) -> Option<Bytes> {
        prefix_successor(&self.0)
    }
}

/// Appends `0x00` to produce the immediate lexicographic successor.
pub fn key_next(key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + 1);
    buf.extend_from_slice(key);
    buf.put_u8(0x00);
    buf.freeze()
}

/// Computes the lexicographic successor of a byte sequence: the smallest
/// sequence strictly greater than every sequence carrying it as a prefix.
///
/// Used as the exclusive upper bound of prefix scans. Returns `None` when the
/// input is empty or all bytes are `0xFF`, in which case the scan is
/// unbounded above.
///
/// Starting from the rightmost byte: increment it if it is below `0xFF`,
/// otherwise drop it and try the previous byte.
pub fn prefix_successor(prefix: &[u8]) -> Option<Bytes> {
    if prefix.is_empty() {
        return None;
    }

    let mut result = BytesMut::from(prefix);
    while let Some(last) = result.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(result.freeze());
        }
        result.truncate(result.len() - 1);
    }

    None
}

/// A bound on the number of records surfaced through an iterator.
///
/// Zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit(pub u64);

impl Limit {
    /// No bound.
    pub const UNBOUNDED: Limit = Limit(0);

    pub fn bounded(&self) -> bool {
        self.0 > 0
    }

    pub fn unbounded(&self) -> bool {
        self.0 == 0
    }

    /// Returns true once `count` items have been produced under a bounded
    /// limit.
    pub fn reached(&self, count: u64) -> bool {
        self.bounded() && count >= self.0
    }
}

impl From<u64> for Limit {
    fn from(n: u64) -> Self {
        Limit(n)
    }
}

impl From<usize> for Limit {
    fn from(n: usize) -> Self {
        Limit(n as u64)
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unbounded() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn should_successor_be_strictly_greater(data: Vec<u8>) {
            let all_ff = !data.is_empty() && data.iter().all(|&b| b == 0xFF);
            prop_assume!(!data.is_empty() && !all_ff);

            let succ = prefix_successor(&data).unwrap();
            prop_assert!(succ.as_ref() > data.as_slice());
        }

        #[test]
        fn should_successor_bound_every_prefixed_key(prefix: Vec<u8>, suffix: Vec<u8>) {
            let all_ff = !prefix.is_empty() && prefix.iter().all(|&b| b == 0xFF);
            prop_assume!(!prefix.is_empty() && !all_ff);

            let succ = prefix_successor(&prefix).unwrap();
            let mut extended = prefix.clone();
            extended.extend(&suffix);
            prop_assert!(extended.as_slice() < succ.as_ref());
        }

        #[test]
        fn should_key_next_be_immediate_successor(data: Vec<u8>) {
            let next = key_next(&data);
            prop_assert!(next.as_ref() > data.as_slice());
            prop_assert_eq!(&next[..data.len()], data.as_slice());
        }
    }

    #[test]
    fn should_increment_simple_byte() {
        assert_eq!(prefix_successor(b"a").unwrap().as_ref(), b"b");
        assert_eq!(prefix_successor(&[0x00]).unwrap().as_ref(), &[0x01]);
        assert_eq!(prefix_successor(&[0xFE]).unwrap().as_ref(), &[0xFF]);
    }

    #[test]
    fn should_truncate_trailing_ff() {
        assert_eq!(prefix_successor(&[0x61, 0xFF]).unwrap().as_ref(), &[0x62]);
        assert_eq!(
            prefix_successor(&[0x61, 0xFF, 0xFF]).unwrap().as_ref(),
            &[0x62]
        );
    }

    #[test]
    fn should_return_none_for_non_incrementable() {
        assert!(prefix_successor(&[]).is_none());
        assert!(prefix_successor(&[0xFF]).is_none());
        assert!(prefix_successor(&[0xFF, 0xFF]).is_none());
    }

    #[test]
    fn should_display_key_as_hex() {
        let key = Key(Bytes::from_static(&[0xba, 0xdc, 0x0f, 0xfe]));
        assert_eq!(key.to_string(), "badc0ffe");
    }

    #[test]
    fn should_compute_record_size() {
        let kv = Kv::new("ab", "cde");
        assert_eq!(kv.size(), 5);
    }

    #[test]
    fn should_reach_bounded_limit_only() {
        let limit = Limit(3);
        assert!(!limit.reached(2));
        assert!(limit.reached(3));
        assert!(limit.reached(4));

        assert!(!Limit::UNBOUNDED.reached(u64::MAX));
        assert_eq!(Limit::UNBOUNDED.to_string(), "unlimited");
        assert_eq!(Limit(42).to_string(), "42");
    }
}
