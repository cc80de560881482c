//! Write-batch accumulator with size, count and duration flush thresholds.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::model::Kv;

/// Staging buffer for puts (and backend-internal bulk mutations).
///
/// A threshold of zero disables that threshold. The accumulator never
/// flushes by itself; owners consult [`should_flush`](Batch::should_flush)
/// after staging and [`would_flush_next`](Batch::would_flush_next) before
/// staging to flush pre-emptively when the next write would push the batch
/// past what the backend accepts in a single round-trip.
pub struct Batch {
    size_threshold: usize,
    ops_threshold: usize,
    time_threshold: Duration,

    batch: Vec<Kv>,
    size: usize,
    ops: usize,
    last_reset: Instant,
    largest: usize,
}

impl Batch {
    pub fn new(size_threshold: usize, ops_threshold: usize, time_threshold: Duration) -> Self {
        let mut b = Self {
            size_threshold,
            ops_threshold,
            time_threshold,
            batch: Vec::new(),
            size: 0,
            ops: 0,
            last_reset: Instant::now(),
            largest: 0,
        };
        b.reset();
        b
    }

    /// An accumulator with every threshold disabled; flushes are explicit.
    pub fn unbounded() -> Self {
        Self::new(0, 0, Duration::ZERO)
    }

    /// Stages one entry.
    pub fn op(&mut self, key: Bytes, value: Bytes) {
        let entry_size = key.len() + value.len();
        self.size += entry_size;
        self.ops += 1;
        if entry_size > self.largest {
            self.largest = entry_size;
        }
        self.batch.push(Kv { key, value });
    }

    /// True iff the batch is non-empty and at least one enabled threshold is
    /// satisfied.
    pub fn should_flush(&self) -> bool {
        if self.batch.is_empty() {
            return false;
        }
        if self.size_threshold > 0 && self.size > self.size_threshold {
            return true;
        }
        if self.ops_threshold > 0 && self.ops >= self.ops_threshold {
            return true;
        }
        if !self.time_threshold.is_zero() && self.last_reset.elapsed() > self.time_threshold {
            return true;
        }
        false
    }

    /// True iff staging `(key, value)` would satisfy an enabled threshold,
    /// i.e. [`should_flush`](Batch::should_flush) after a hypothetical
    /// [`op`](Batch::op).
    pub fn would_flush_next(&self, key: &[u8], value: &[u8]) -> bool {
        if self.size_threshold > 0 && self.size + key.len() + value.len() > self.size_threshold {
            return true;
        }
        if self.ops_threshold > 0 && self.ops + 1 >= self.ops_threshold {
            return true;
        }
        if !self.time_threshold.is_zero() && self.last_reset.elapsed() > self.time_threshold {
            return true;
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Total staged bytes (keys plus values).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Largest single entry staged since the last reset, for diagnostics.
    pub fn largest_entry(&self) -> usize {
        self.largest
    }

    /// Drains the pending entries and resets counters in one step, the
    /// flush-path equivalent of reading the batch then calling
    /// [`reset`](Batch::reset).
    pub fn take(&mut self) -> Vec<Kv> {
        let out = std::mem::take(&mut self.batch);
        self.reset();
        out
    }

    /// Clears the batch, counters, and the last-reset timestamp.
    pub fn reset(&mut self) {
        let capacity = if self.ops_threshold > 0 {
            self.ops_threshold
        } else {
            1024
        };
        self.batch = Vec::with_capacity(capacity);
        self.size = 0;
        self.ops = 0;
        self.largest = 0;
        self.last_reset = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv_bytes(key: &str, value: &str) -> (Bytes, Bytes) {
        (
            Bytes::copy_from_slice(key.as_bytes()),
            Bytes::copy_from_slice(value.as_bytes()),
        )
    }

    #[test]
    fn should_not_flush_when_empty() {
        let batch = Batch::new(1, 1, Duration::from_nanos(1));
        assert!(!batch.should_flush());
    }

    #[test]
    fn should_flush_when_size_threshold_exceeded() {
        // given: 10-byte threshold
        let mut batch = Batch::new(10, 0, Duration::ZERO);

        // when: exactly at the threshold
        let (k, v) = kv_bytes("12345", "12345");
        batch.op(k, v);

        // then: strict comparison, not yet
        assert!(!batch.should_flush());

        let (k, v) = kv_bytes("a", "");
        batch.op(k, v);
        assert!(batch.should_flush());
    }

    #[test]
    fn should_flush_when_ops_threshold_met() {
        let mut batch = Batch::new(0, 2, Duration::ZERO);
        let (k, v) = kv_bytes("a", "1");
        batch.op(k.clone(), v.clone());
        assert!(!batch.should_flush());
        batch.op(k, v);
        assert!(batch.should_flush());
    }

    #[test]
    fn should_flush_when_time_threshold_elapsed() {
        let mut batch = Batch::new(0, 0, Duration::from_nanos(1));
        let (k, v) = kv_bytes("a", "1");
        batch.op(k, v);
        std::thread::sleep(Duration::from_millis(1));
        assert!(batch.should_flush());
    }

    #[test]
    fn should_never_flush_with_thresholds_disabled() {
        let mut batch = Batch::unbounded();
        for _ in 0..10_000 {
            let (k, v) = kv_bytes("key", "value");
            batch.op(k, v);
        }
        assert!(!batch.should_flush());
    }

    #[test]
    fn should_predict_flush_for_next_entry() {
        // given
        let mut batch = Batch::new(10, 0, Duration::ZERO);
        let (k, v) = kv_bytes("1234", "1234");
        batch.op(k, v);
        assert!(!batch.should_flush());

        // then: prediction agrees with a hypothetical op
        assert!(!batch.would_flush_next(b"12", b""));
        assert!(batch.would_flush_next(b"123", b""));

        let mut ops_batch = Batch::new(0, 3, Duration::ZERO);
        let (k, v) = kv_bytes("a", "1");
        ops_batch.op(k.clone(), v.clone());
        assert!(!ops_batch.would_flush_next(b"a", b"1"));
        ops_batch.op(k, v);
        assert!(ops_batch.would_flush_next(b"a", b"1"));
    }

    #[test]
    fn should_drain_and_reset_on_take() {
        // given
        let mut batch = Batch::new(0, 2, Duration::ZERO);
        let (k, v) = kv_bytes("key", "value");
        batch.op(k.clone(), v.clone());
        batch.op(k, v);
        assert!(batch.should_flush());

        // when
        let drained = batch.take();

        // then
        assert_eq!(drained.len(), 2);
        assert!(batch.is_empty());
        assert_eq!(batch.size(), 0);
        assert!(!batch.should_flush());
    }

    #[test]
    fn should_track_largest_entry() {
        let mut batch = Batch::unbounded();
        let (k, v) = kv_bytes("a", "1");
        batch.op(k, v);
        let (k, v) = kv_bytes("key", "longer-value");
        batch.op(k, v);
        assert_eq!(batch.largest_entry(), 15);
    }
}
