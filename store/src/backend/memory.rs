//! In-memory backend over a `BTreeMap`.
//!
//! The reference implementation of the contract: it runs the same transform
//! pipeline and batch accumulator as the remote backends, which makes it the
//! substrate for the conformance suite and for local netkv servers in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::Batch;
use crate::compression::{Compressor, DEFAULT_COMPRESSION_THRESHOLD};
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::iterator::{self, KvIterator};
use crate::model::{prefix_successor, Kv, Limit};
use crate::options::{Capabilities, ReadOptions, StoreOptions};
use crate::pipeline::{EmptyValuePolicy, Pipeline};

pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    batch: Mutex<Batch>,
    pipeline: Pipeline,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_pipeline(Pipeline::passthrough())
    }

    pub fn with_pipeline(pipeline: Pipeline) -> Self {
        Self::with_pipeline_and_batch(pipeline, Batch::unbounded())
    }

    pub fn with_pipeline_and_batch(pipeline: Pipeline, batch: Batch) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(BTreeMap::new()),
                batch: Mutex::new(batch),
                pipeline,
            }),
        }
    }

    /// Opens a store from a `memory://` DSN.
    ///
    /// Options: `keyPrefix` (hex), `compression`,
    /// `compression_size_threshold`, `batch_size_threshold`,
    /// `batch_ops_threshold`, `batch_time_threshold` (seconds).
    pub fn open(dsn: &Dsn, _options: StoreOptions) -> Result<Self> {
        let threshold =
            dsn.usize_option("compression_size_threshold", DEFAULT_COMPRESSION_THRESHOLD)?;
        let compressor =
            Compressor::from_mode(&dsn.option("compression").unwrap_or_default(), threshold)?;
        let key_prefix = dsn.hex_option("keyPrefix")?.unwrap_or_default();

        let batch = Batch::new(
            dsn.usize_option("batch_size_threshold", 0)?,
            dsn.usize_option("batch_ops_threshold", 0)?,
            dsn.seconds_option("batch_time_threshold", std::time::Duration::ZERO)?,
        );

        Ok(Self::with_pipeline_and_batch(
            Pipeline::new(key_prefix, compressor, EmptyValuePolicy::Native),
            batch,
        ))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn decode_kv(&self, physical_key: Bytes, value: Bytes, key_only: bool) -> Result<Kv> {
        let key = self.pipeline.logical_key(physical_key);
        let value = if key_only {
            Bytes::new()
        } else {
            self.pipeline.decode_value(value)?
        };
        Ok(Kv { key, value })
    }

    /// Snapshots the physical range `[start, end)`; `end = None` is
    /// unbounded above.
    fn snapshot_range(&self, start: Bytes, end: Option<Bytes>) -> Result<Vec<(Bytes, Bytes)>> {
        let data = self
            .data
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;

        let rows = match end {
            Some(end) => {
                if start >= end {
                    return Ok(Vec::new());
                }
                data.range(start..end)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            }
            None => data
                .range(start..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        Ok(rows)
    }

    fn apply(&self, entries: Vec<Kv>) -> Result<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        for kv in entries {
            data.insert(kv.key, kv.value);
        }
        Ok(())
    }
}

#[async_trait]
impl crate::KvStore for MemoryStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let physical_key = self.inner.pipeline.physical_key(&key);
        let physical_value = self.inner.pipeline.encode_value(value)?;

        let should_flush = {
            let mut batch = self
                .inner
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.op(physical_key, physical_value);
            batch.should_flush()
        };

        if should_flush {
            self.flush_puts().await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn flush_puts(&self) -> Result<()> {
        let pending = {
            let mut batch = self
                .inner
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.take()
        };
        if pending.is_empty() {
            return Ok(());
        }
        self.inner.apply(pending)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> Result<Bytes> {
        let physical_key = self.inner.pipeline.physical_key(&key);
        let value = {
            let data = self
                .inner
                .data
                .read()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            data.get(&physical_key).cloned()
        };
        match value {
            Some(v) => self.inner.pipeline.decode_value(v),
            None => Err(Error::NotFound),
        }
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let inner = Arc::clone(&self.inner);
        iterator::drive(sender, async move {
            for key in keys {
                let physical_key = inner.pipeline.physical_key(&key);
                let value = {
                    let data = inner
                        .data
                        .read()
                        .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
                    data.get(&physical_key).cloned()
                };
                // A missing key interrupts the resultset.
                let value = value.ok_or(Error::NotFound)?;
                let value = inner.pipeline.decode_value(value)?;
                if !producer.push_item(Kv { key, value }).await {
                    break;
                }
            }
            Ok(())
        });
        iter
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()> {
        let mut data = self
            .inner
            .data
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        for key in keys {
            let physical_key = self.inner.pipeline.physical_key(&key);
            data.remove(&physical_key);
        }
        Ok(())
    }

    fn scan(
        &self,
        start: Bytes,
        exclusive_end: Bytes,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let inner = Arc::clone(&self.inner);
        iterator::drive(sender, async move {
            if exclusive_end.is_empty() {
                return Ok(());
            }
            let physical_start = inner.pipeline.physical_key(&start);
            let physical_end = inner.pipeline.physical_key(&exclusive_end);
            let rows = inner.snapshot_range(physical_start, Some(physical_end))?;

            let mut count = 0u64;
            for (k, v) in rows {
                if !producer.push_item(inner.decode_kv(k, v, options.key_only)?).await {
                    break;
                }
                count += 1;
                if limit.reached(count) {
                    break;
                }
            }
            Ok(())
        });
        iter
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let inner = Arc::clone(&self.inner);
        iterator::drive(sender, async move {
            let physical_prefix = inner.pipeline.physical_key(&prefix);
            let end = prefix_successor(&physical_prefix);
            let rows = inner.snapshot_range(physical_prefix, end)?;

            let mut count = 0u64;
            for (k, v) in rows {
                if !producer.push_item(inner.decode_kv(k, v, options.key_only)?).await {
                    break;
                }
                count += 1;
                if limit.reached(count) {
                    break;
                }
            }
            Ok(())
        });
        iter
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let inner = Arc::clone(&self.inner);
        iterator::drive(sender, async move {
            let mut count = 0u64;
            'prefixes: for prefix in prefixes {
                let physical_prefix = inner.pipeline.physical_key(&prefix);
                let end = prefix_successor(&physical_prefix);
                let rows = inner.snapshot_range(physical_prefix, end)?;

                for (k, v) in rows {
                    if !producer.push_item(inner.decode_kv(k, v, options.key_only)?).await {
                        break 'prefixes;
                    }
                    count += 1;
                    if limit.reached(count) {
                        break 'prefixes;
                    }
                }
            }
            Ok(())
        });
        iter
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_empty_value: true,
            supports_delete: true,
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KvStore;

    #[tokio::test]
    async fn should_not_observe_unflushed_puts() {
        // given
        let store = MemoryStore::new();
        store
            .put(Bytes::from("k"), Bytes::from("v"))
            .await
            .unwrap();

        // then: staged but not flushed
        assert_eq!(store.get(Bytes::from("k")).await, Err(Error::NotFound));

        // when
        store.flush_puts().await.unwrap();

        // then
        assert_eq!(store.get(Bytes::from("k")).await.unwrap(), Bytes::from("v"));
    }

    #[tokio::test]
    async fn should_flush_when_ops_threshold_reached() {
        // given: flush every 2 puts
        let store = MemoryStore::with_pipeline_and_batch(
            Pipeline::passthrough(),
            Batch::new(0, 2, std::time::Duration::ZERO),
        );

        // when
        store
            .put(Bytes::from("a"), Bytes::from("1"))
            .await
            .unwrap();
        store
            .put(Bytes::from("b"), Bytes::from("2"))
            .await
            .unwrap();

        // then: the threshold flushed for us
        assert_eq!(store.get(Bytes::from("a")).await.unwrap(), Bytes::from("1"));
        assert_eq!(store.get(Bytes::from("b")).await.unwrap(), Bytes::from("2"));
    }

    #[tokio::test]
    async fn should_store_physical_keys_under_prefix() {
        // given
        let pipeline = Pipeline::new(
            Bytes::from_static(b"tbl;"),
            Compressor::NoOp,
            EmptyValuePolicy::Native,
        );
        let store = MemoryStore::with_pipeline(pipeline);

        // when
        store
            .put(Bytes::from("key"), Bytes::from("value"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // then: callers see the logical key, the map holds the physical one
        assert_eq!(
            store.get(Bytes::from("key")).await.unwrap(),
            Bytes::from("value")
        );
        let data = store.inner.data.read().unwrap();
        assert!(data.contains_key(&Bytes::from_static(b"tbl;key")));
    }

    #[tokio::test]
    async fn should_scan_degenerate_ranges_as_empty() {
        // given
        let store = MemoryStore::new();
        store
            .put(Bytes::from("b"), Bytes::from("1"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // then: inverted and empty-end ranges yield nothing
        let inverted = store.scan(
            Bytes::from("c"),
            Bytes::from("a"),
            Limit::UNBOUNDED,
            ReadOptions::default(),
        );
        assert!(inverted.collect().await.unwrap().is_empty());

        let empty_end = store.scan(
            Bytes::from("a"),
            Bytes::new(),
            Limit::UNBOUNDED,
            ReadOptions::default(),
        );
        assert!(empty_end.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_open_from_dsn_with_options() {
        // given
        let dsn = Dsn::parse("memory://local?keyPrefix=0102&compression=zstd").unwrap();

        // when
        let store = MemoryStore::open(&dsn, StoreOptions::default()).unwrap();
        store
            .put(Bytes::from("k"), Bytes::from("v"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // then
        assert_eq!(store.get(Bytes::from("k")).await.unwrap(), Bytes::from("v"));
        let data = store.inner.data.read().unwrap();
        assert!(data.keys().all(|k| k.starts_with(&[0x01, 0x02])));
    }
}
