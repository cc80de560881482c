//! Purgeable overlay: height-tagged deletion markers with a sliding TTL
//! window.
//!
//! Every user write at the current height also writes a marker key
//! `table_prefix || be_u64(height) || key` with a single zero byte as its
//! value. [`purge_keys`](PurgeableStore::purge_keys) scans markers below
//! `current_height - ttl` and deletes both the markers and the keys they
//! reference, in bounded chunks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::iterator::KvIterator;
use crate::model::Limit;
use crate::options::{Capabilities, ReadOptions};
use crate::KvStore;

/// Maximum number of keys handed to one purge deletion round-trip.
pub const PURGE_BATCH_SIZE: usize = 500;

/// Builds a deletion-marker key for `height` and `key` under
/// `table_prefix`.
pub fn deletion_key(table_prefix: &[u8], height: u64, key: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(table_prefix.len() + 8 + key.len());
    buf.extend_from_slice(table_prefix);
    buf.put_u64(height);
    buf.extend_from_slice(key);
    buf.freeze()
}

/// Decorates a deletable store with height-tagged markers and bulk purge.
///
/// The owner marks the current height before each write burst; the overlay
/// trusts the height to advance monotonically. A single writer owns the
/// height; concurrent writers are unsupported.
pub struct PurgeableStore {
    inner: Arc<dyn KvStore>,
    table_prefix: Bytes,
    ttl_in_heights: u64,
    height: AtomicU64,
    height_set: AtomicBool,
}

impl PurgeableStore {
    /// # Panics
    ///
    /// Panics when the wrapped store does not support batched deletion.
    pub fn new(table_prefix: Bytes, inner: Arc<dyn KvStore>, ttl_in_heights: u64) -> Self {
        assert!(
            inner.capabilities().supports_delete,
            "purgeable stores require a backend that supports batch deletion"
        );
        Self {
            inner,
            table_prefix,
            ttl_in_heights,
            height: AtomicU64::new(0),
            height_set: AtomicBool::new(false),
        }
    }

    /// Marks the height tagged onto every following put.
    pub fn mark_current_height(&self, height: u64) {
        self.height.store(height, Ordering::Release);
        self.height_set.store(true, Ordering::Release);
    }

    fn current_height(&self) -> u64 {
        assert!(
            self.height_set.load(Ordering::Acquire),
            "purgeable store height not set; call mark_current_height before put"
        );
        self.height.load(Ordering::Acquire)
    }

    fn deletion_key(&self, height: u64, key: &[u8]) -> Bytes {
        deletion_key(&self.table_prefix, height, key)
    }

    /// Recovers the user key a marker references.
    fn original_key(&self, marker: &Bytes) -> Bytes {
        marker.slice(self.table_prefix.len() + 8..)
    }

    /// Deletes every marker below `current_height - ttl` along with the
    /// keys they reference. Chunks are deleted as they fill; completed
    /// chunks stay deleted when a later chunk fails.
    ///
    /// A no-op until a height is marked or while the window has not yet
    /// cleared the ttl.
    pub async fn purge_keys(&self) -> Result<()> {
        if !self.height_set.load(Ordering::Acquire) {
            return Ok(());
        }
        let height = self.height.load(Ordering::Acquire);
        if height < self.ttl_in_heights {
            return Ok(());
        }
        let high = height - self.ttl_in_heights;
        tracing::debug!(high_height = high, "purging deletion markers below height");

        let start = self.deletion_key(0, &[]);
        let end = self.deletion_key(high, &[]);
        let mut markers = self
            .inner
            .scan(start, end, Limit::UNBOUNDED, ReadOptions::default());

        let mut pending: Vec<Bytes> = Vec::new();
        while markers.next().await {
            if pending.len() + 2 > PURGE_BATCH_SIZE {
                self.inner
                    .batch_delete(std::mem::take(&mut pending))
                    .await
                    .map_err(|e| Error::Storage(format!("unable to delete batch: {}", e)))?;
            }
            let marker = markers.item().key.clone();
            pending.push(self.original_key(&marker));
            pending.push(marker);
        }
        if let Some(err) = markers.err() {
            return Err(err.clone());
        }

        if !pending.is_empty() {
            self.inner
                .batch_delete(pending)
                .await
                .map_err(|e| Error::Storage(format!("unable to delete batch: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for PurgeableStore {
    /// Writes the record and its deletion marker; both go through the
    /// underlying batching machinery and either failure fails the call.
    ///
    /// # Panics
    ///
    /// Panics when no height was marked yet.
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let height = self.current_height();
        self.inner.put(key.clone(), value).await?;

        let marker = self.deletion_key(height, &key);
        self.inner
            .put(marker, Bytes::from_static(&[0x00]))
            .await
    }

    async fn flush_puts(&self) -> Result<()> {
        self.inner.flush_puts().await
    }

    async fn get(&self, key: Bytes) -> Result<Bytes> {
        self.inner.get(key).await
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        self.inner.batch_get(keys)
    }

    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()> {
        self.inner.batch_delete(keys).await
    }

    fn scan(
        &self,
        start: Bytes,
        exclusive_end: Bytes,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator {
        self.inner.scan(start, exclusive_end, limit, options)
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        self.inner.prefix(prefix, limit, options)
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        self.inner.batch_prefix(prefixes, limit, options)
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
