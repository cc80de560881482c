//! Embedded log-structured backend on SlateDB.
//!
//! The engine compresses blocks natively, so the `compression` DSN option is
//! legacy decode-only: values written by an older compressing deployment
//! stay readable, new writes are never compressed here.

use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use slatedb::config::Settings;
use slatedb::object_store::{self, ObjectStore};
use slatedb::{Db, DbBuilder, WriteBatch};

use crate::batch::Batch;
use crate::compression::Compressor;
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::iterator::{self, KvIterator};
use crate::model::{prefix_successor, Kv, Limit};
use crate::options::{Capabilities, ReadOptions, StoreOptions};
use crate::pipeline::{EmptyValuePolicy, Pipeline};

/// Engine write batches beyond this size are flushed early and the put
/// continues in a fresh batch.
const MAX_ENGINE_BATCH_BYTES: usize = 64 * 1024 * 1024;

pub struct SlateStore {
    db: Arc<Db>,
    batch: Mutex<Batch>,
    pipeline: Pipeline,
}

impl SlateStore {
    /// Opens a store from a `slate://<filesystem-path>` DSN.
    pub async fn open(dsn: &Dsn, _options: StoreOptions) -> Result<Self> {
        let path = dsn.path();
        if path.is_empty() || path == "/" {
            return Err(Error::InvalidInput(format!(
                "slate dsn {:?} is missing a filesystem path",
                dsn.as_str()
            )));
        }

        std::fs::create_dir_all(path).map_err(|e| {
            Error::Storage(format!("creating storage directory {:?}: {}", path, e))
        })?;
        let local = object_store::local::LocalFileSystem::new_with_prefix(path)
            .map_err(|e| Error::Storage(format!("creating local filesystem store: {}", e)))?;

        let compressor = Compressor::legacy(&dsn.option("compression").unwrap_or_default())?;
        Self::open_with_object_store(Arc::new(local), compressor).await
    }

    /// Opens a store over an explicit object store, e.g. an in-memory one
    /// for tests.
    pub async fn open_with_object_store(
        object_store: Arc<dyn ObjectStore>,
        compressor: Compressor,
    ) -> Result<Self> {
        let db = DbBuilder::new("db", object_store)
            .with_settings(Settings::default())
            .build()
            .await
            .map_err(|e| Error::Storage(format!("opening slatedb: {}", e)))?;

        Ok(Self {
            db: Arc::new(db),
            batch: Mutex::new(Batch::new(MAX_ENGINE_BATCH_BYTES, 0, std::time::Duration::ZERO)),
            pipeline: Pipeline::new(Bytes::new(), compressor, EmptyValuePolicy::Native),
        })
    }

    async fn write_pending(&self, pending: Vec<Kv>) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut wb = WriteBatch::new();
        for kv in pending {
            wb.put(kv.key.as_ref(), kv.value.as_ref());
        }
        self.db.write(wb).await.map_err(Error::storage)?;
        self.db.flush().await.map_err(Error::storage)
    }

    fn spawn_range_scan(
        &self,
        start: Bytes,
        end: Option<Bytes>,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let db = Arc::clone(&self.db);
        let pipeline = self.pipeline.clone();
        iterator::drive(sender, async move {
            if let Some(end) = &end {
                if start >= *end {
                    return Ok(());
                }
            }
            let range = (
                Bound::Included(start),
                match end {
                    Some(end) => Bound::Excluded(end),
                    None => Bound::Unbounded,
                },
            );
            let mut rows = db.scan(range).await.map_err(Error::storage)?;

            let mut count = 0u64;
            while let Some(row) = rows.next().await.map_err(Error::storage)? {
                let value = if options.key_only {
                    Bytes::new()
                } else {
                    pipeline.decode_value(row.value)?
                };
                if !producer.push_item(Kv { key: row.key, value }).await {
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
}

#[async_trait]
impl crate::KvStore for SlateStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let value = self.pipeline.encode_value(value)?;

        // Flush early rather than hand the engine an oversized batch.
        let flush_first = {
            let batch = self
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.would_flush_next(&key, &value)
        };
        if flush_first {
            tracing::debug!("engine batch limit reached, flushing early");
            self.flush_puts().await?;
        }

        let mut batch = self
            .batch
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
        batch.op(key, value);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn flush_puts(&self) -> Result<()> {
        let pending = {
            let mut batch = self
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.take()
        };
        self.write_pending(pending).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> Result<Bytes> {
        match self.db.get(key.as_ref()).await.map_err(Error::storage)? {
            Some(value) => self.pipeline.decode_value(value),
            None => Err(Error::NotFound),
        }
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let db = Arc::clone(&self.db);
        let pipeline = self.pipeline.clone();
        iterator::drive(sender, async move {
            for key in keys {
                let value = db
                    .get(key.as_ref())
                    .await
                    .map_err(Error::storage)?
                    .ok_or(Error::NotFound)?;
                let value = pipeline.decode_value(value)?;
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
        tracing::debug!(key_count = keys.len(), "batch deletion");
        if keys.is_empty() {
            return Ok(());
        }
        let mut wb = WriteBatch::new();
        for key in &keys {
            wb.delete(key.as_ref());
        }
        self.db.write(wb).await.map_err(Error::storage)?;
        self.db.flush().await.map_err(Error::storage)
    }

    fn scan(
        &self,
        start: Bytes,
        exclusive_end: Bytes,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator {
        if exclusive_end.is_empty() {
            let (sender, iter) = iterator::channel();
            sender.push_finished();
            return iter;
        }
        self.spawn_range_scan(start, Some(exclusive_end), limit, options)
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        let end = prefix_successor(&prefix);
        self.spawn_range_scan(prefix, end, limit, options)
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let db = Arc::clone(&self.db);
        let pipeline = self.pipeline.clone();
        iterator::drive(sender, async move {
            let mut count = 0u64;
            'prefixes: for prefix in prefixes {
                let range = (
                    Bound::Included(prefix.clone()),
                    match prefix_successor(&prefix) {
                        Some(end) => Bound::Excluded(end),
                        None => Bound::Unbounded,
                    },
                );
                let mut rows = db.scan(range).await.map_err(Error::storage)?;
                while let Some(row) = rows.next().await.map_err(Error::storage)? {
                    let value = if options.key_only {
                        Bytes::new()
                    } else {
                        pipeline.decode_value(row.value)?
                    };
                    if !producer.push_item(Kv { key: row.key, value }).await {
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
        self.db.close().await.map_err(Error::storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KvStore;

    async fn in_memory_store() -> SlateStore {
        let object_store = Arc::new(object_store::memory::InMemory::new());
        SlateStore::open_with_object_store(object_store, Compressor::NoOp)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn should_roundtrip_through_engine() {
        // given
        let store = in_memory_store().await;
        store
            .put(Bytes::from("k"), Bytes::from("v"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // then
        assert_eq!(store.get(Bytes::from("k")).await.unwrap(), Bytes::from("v"));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_scan_in_key_order() {
        // given
        let store = in_memory_store().await;
        for key in ["c", "a", "b"] {
            store
                .put(Bytes::from(key), Bytes::from("v"))
                .await
                .unwrap();
        }
        store.flush_puts().await.unwrap();

        // when
        let items = store
            .scan(
                Bytes::from("a"),
                Bytes::from("c"),
                Limit::UNBOUNDED,
                ReadOptions::default(),
            )
            .collect()
            .await
            .unwrap();

        // then
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, Bytes::from("a"));
        assert_eq!(items[1].key, Bytes::from("b"));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_decode_legacy_compressed_values() {
        // given: an entry written by an older compressing deployment
        let store = in_memory_store().await;
        let original = Bytes::from(vec![b'x'; 2000]);
        let legacy = Compressor::Zstd { threshold: 0 }
            .compress(original.clone())
            .unwrap();
        store.put(Bytes::from("old"), legacy).await.unwrap();
        store.flush_puts().await.unwrap();

        // then: the magic sniff decompresses it transparently
        assert_eq!(store.get(Bytes::from("old")).await.unwrap(), original);
        store.close().await.unwrap();
    }
}
