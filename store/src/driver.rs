//! The backend driver contract.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::iterator::KvIterator;
use crate::model::Limit;
use crate::options::{Capabilities, ReadOptions};

/// The uniform operation surface every backend honors with identical
/// semantics.
///
/// Scan-shaped operations return immediately with a [`KvIterator`] whose
/// producer runs as a detached task; the consumer pulls items with
/// `next().await`. Stores are **not** concurrent-write-safe: callers must
/// externally serialize `put`/`flush_puts` or partition by key.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Stages a write into the store's batch. The batch may be flushed
    /// synchronously when a threshold is breached; call
    /// [`flush_puts`](Self::flush_puts) to make all staged entries durable.
    ///
    /// Fails with [`Error::EmptyValueRejected`](crate::Error) when `value`
    /// is empty and the store is not opted into empty values. The order of
    /// staged writes is preserved within a batch.
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()>;

    /// Writes all staged puts to the backend. On success the batch is
    /// empty. On failure the batch contents are unspecified; the caller
    /// must treat the store as possibly inconsistent and retry from a known
    /// point.
    async fn flush_puts(&self) -> Result<()>;

    /// Fetches a single key, or [`Error::NotFound`](crate::Error).
    ///
    /// Returns the latest durable value after the last successful flush;
    /// whether unflushed puts are observed is backend-dependent.
    async fn get(&self, key: Bytes) -> Result<Bytes>;

    /// Fetches a batch of keys. The iterator yields one record per input
    /// key, in input order. The first missing key is fatal: it terminates
    /// the iterator with [`Error::NotFound`](crate::Error) and no partial
    /// resultset is reported beyond the records already produced.
    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator;

    /// Deletes the given keys. Unordered, atomic per key, idempotent:
    /// deleting a missing key is not an error.
    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()>;

    /// Scans the half-open range `[start, exclusive_end)` in ascending key
    /// order, up to `limit` records. An empty range (`start == end` or an
    /// empty end key) yields nothing.
    fn scan(
        &self,
        start: Bytes,
        exclusive_end: Bytes,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator;

    /// Yields every record whose key begins with `prefix`, ascending, up to
    /// `limit`.
    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator;

    /// Yields matches for each prefix in input order, keys ascending within
    /// each prefix. `limit` caps the total across all prefixes, not each
    /// prefix.
    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator;

    /// Capability flags for this backend.
    fn capabilities(&self) -> Capabilities;

    /// Releases backend resources. Pending unflushed puts are lost; flushing
    /// first is the caller's obligation.
    async fn close(&self) -> Result<()>;
}
