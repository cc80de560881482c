//! Distributed raw key-value cluster backend.
//!
//! The cluster caps every scan request, so range and prefix reads loop over
//! slices of `min(limit, max_scan_limit)`, advancing the cursor to
//! `last_key || 0x00` after each slice and stopping on a short slice or on
//! the caller's limit. The engine rejects empty values; when the store is
//! opted in, the sentinel encoding in the value pipeline round-trips them.

pub mod client;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::Batch;
use crate::compression::{Compressor, DEFAULT_COMPRESSION_THRESHOLD};
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::iterator::{self, IteratorSender, KvIterator};
use crate::model::{key_next, prefix_successor, Key, Kv, Limit};
use crate::options::{Capabilities, ReadOptions, StoreOptions};
use crate::pipeline::{EmptyValuePolicy, Pipeline};

use self::client::RawKv;

/// Engine cap on a single scan request.
const DEFAULT_MAX_SCAN_LIMIT: u32 = 10240;

/// Default byte threshold for the put accumulator and for flush chunking.
const DEFAULT_MAX_BATCH_PUT_SIZE: usize = 70_000_000;

/// Configuration derived from a `tikv://` DSN.
#[derive(Debug, Clone)]
pub struct TikvConfig {
    pub key_prefix: Bytes,
    pub compressor: Compressor,
    pub empty_values: EmptyValuePolicy,
    pub batch_size_threshold: usize,
    pub batch_ops_threshold: usize,
    pub batch_time_threshold: Duration,
    pub max_scan_limit: u32,
    pub max_batch_put_size: usize,
    pub batch_pair_count: usize,
}

impl Default for TikvConfig {
    fn default() -> Self {
        Self {
            key_prefix: Bytes::new(),
            compressor: Compressor::NoOp,
            empty_values: EmptyValuePolicy::Reject,
            batch_size_threshold: DEFAULT_MAX_BATCH_PUT_SIZE,
            batch_ops_threshold: 0,
            batch_time_threshold: Duration::ZERO,
            max_scan_limit: DEFAULT_MAX_SCAN_LIMIT,
            max_batch_put_size: DEFAULT_MAX_BATCH_PUT_SIZE,
            batch_pair_count: 0,
        }
    }
}

impl TikvConfig {
    /// Parses `tikv://host1,host2,...:port/<table_prefix>?<options>`.
    ///
    /// The table prefix namespaces this store in the shared cluster
    /// key-space; it must be at least 3 characters and is suffixed with a
    /// `;` separator.
    pub fn from_dsn(dsn: &Dsn, options: StoreOptions) -> Result<Self> {
        let table_prefix = dsn.path_segment();
        if table_prefix.len() < 3 {
            return Err(Error::InvalidInput(format!(
                "tikv table prefix {:?} must be at least 3 characters",
                table_prefix
            )));
        }
        let mut key_prefix = Vec::with_capacity(table_prefix.len() + 1);
        key_prefix.extend_from_slice(table_prefix.as_bytes());
        key_prefix.push(b';');

        let threshold =
            dsn.usize_option("compression_size_threshold", DEFAULT_COMPRESSION_THRESHOLD)?;
        let compressor =
            Compressor::from_mode(&dsn.option("compression").unwrap_or_default(), threshold)?;

        let empty_values = if options.enable_empty_value {
            EmptyValuePolicy::Encode
        } else {
            EmptyValuePolicy::Reject
        };

        Ok(Self {
            key_prefix: Bytes::from(key_prefix),
            compressor,
            empty_values,
            batch_size_threshold: dsn
                .usize_option("batch_size_threshold", DEFAULT_MAX_BATCH_PUT_SIZE)?,
            batch_ops_threshold: dsn.usize_option("batch_ops_threshold", 0)?,
            batch_time_threshold: dsn.seconds_option("batch_time_threshold", Duration::ZERO)?,
            max_scan_limit: dsn.u64_option("tikv_max_scan_limit", DEFAULT_MAX_SCAN_LIMIT as u64)?
                as u32,
            max_batch_put_size: dsn
                .usize_option("tikv_max_batch_put_size", DEFAULT_MAX_BATCH_PUT_SIZE)?,
            batch_pair_count: dsn.usize_option("tikv_batch_pair_count", 0)?,
        })
    }

    /// The PD endpoints of the DSN authority, one `host:port` per
    /// comma-separated host.
    pub fn endpoints(dsn: &Dsn) -> Result<Vec<String>> {
        let hosts = dsn.host_str().ok_or_else(|| {
            Error::InvalidInput(format!("tikv dsn {:?} is missing hosts", dsn.as_str()))
        })?;
        let port = dsn.port().ok_or_else(|| {
            Error::InvalidInput(format!("tikv dsn {:?} is missing a port", dsn.as_str()))
        })?;
        Ok(hosts
            .split(',')
            .map(|h| format!("{}:{}", h, port))
            .collect())
    }
}

pub struct TikvStore {
    client: Arc<dyn RawKv>,
    pipeline: Pipeline,
    batch: Mutex<Batch>,
    max_scan_limit: u32,
    max_batch_put_size: usize,
    batch_pair_count: usize,
}

impl TikvStore {
    pub fn new(client: Arc<dyn RawKv>, config: TikvConfig) -> Self {
        Self {
            client,
            pipeline: Pipeline::new(
                config.key_prefix,
                config.compressor,
                config.empty_values,
            ),
            batch: Mutex::new(Batch::new(
                config.batch_size_threshold,
                config.batch_ops_threshold,
                config.batch_time_threshold,
            )),
            max_scan_limit: config.max_scan_limit.max(1),
            max_batch_put_size: config.max_batch_put_size,
            batch_pair_count: config.batch_pair_count,
        }
    }

    /// Splits the pending batch into engine-sized requests.
    fn chunk_pending(&self, pending: Vec<Kv>) -> Vec<Vec<Kv>> {
        let mut chunks = Vec::new();
        let mut current: Vec<Kv> = Vec::new();
        let mut current_size = 0usize;
        for kv in pending {
            let over_size =
                self.max_batch_put_size > 0 && current_size + kv.size() > self.max_batch_put_size;
            let over_count = self.batch_pair_count > 0 && current.len() >= self.batch_pair_count;
            if !current.is_empty() && (over_size || over_count) {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += kv.size();
            current.push(kv);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// One slicing scan over the physical range, feeding the iterator and
    /// honoring a limit counter shared across calls.
    async fn scan_slices(
        client: &Arc<dyn RawKv>,
        pipeline: &Pipeline,
        producer: &IteratorSender,
        start: Bytes,
        exclusive_end: Option<Bytes>,
        limit: Limit,
        key_only: bool,
        max_scan_limit: u32,
        count: &mut u64,
    ) -> Result<bool> {
        let mut cursor = start;
        loop {
            let slice_size = if limit.bounded() {
                (limit.0 - *count).min(max_scan_limit as u64) as u32
            } else {
                max_scan_limit
            };
            if slice_size == 0 {
                return Ok(false);
            }

            let rows = client
                .scan(cursor.clone(), exclusive_end.clone(), slice_size)
                .await?;
            let row_count = rows.len();

            for kv in rows {
                cursor = key_next(&kv.key);
                let key = pipeline.logical_key(kv.key);
                let value = if key_only {
                    Bytes::new()
                } else {
                    pipeline.decode_value(kv.value)?
                };
                if !producer.push_item(Kv { key, value }).await {
                    return Ok(false);
                }
                *count += 1;
                if limit.reached(*count) {
                    return Ok(false);
                }
            }

            if row_count < slice_size as usize {
                return Ok(true);
            }
        }
    }
}

#[async_trait]
impl crate::KvStore for TikvStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let physical_key = self.pipeline.physical_key(&key);
        let physical_value = self.pipeline.encode_value(value)?;

        // Flush pre-emptively so a single request never exceeds what the
        // cluster accepts.
        let flush_first = {
            let batch = self
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            !batch.is_empty() && batch.would_flush_next(&physical_key, &physical_value)
        };
        if flush_first {
            self.flush_puts().await?;
        }

        let should_flush = {
            let mut batch = self
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.op(physical_key, physical_value);
            batch.should_flush()
        };
        if should_flush {
            return self.flush_puts().await;
        }
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
        if pending.is_empty() {
            return Ok(());
        }

        let total = pending.len();
        for chunk in self.chunk_pending(pending) {
            self.client.batch_put(chunk).await?;
        }
        tracing::debug!(pair_count = total, "flushed puts");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> Result<Bytes> {
        let physical_key = self.pipeline.physical_key(&key);
        match self.client.get(physical_key).await? {
            Some(value) => self.pipeline.decode_value(value),
            None => Err(Error::NotFound),
        }
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let client = Arc::clone(&self.client);
        let pipeline = self.pipeline.clone();
        iterator::drive(sender, async move {
            for key in keys {
                let physical_key = pipeline.physical_key(&key);
                let value = client
                    .get(physical_key)
                    .await?
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
        let physical_keys = keys
            .iter()
            .map(|k| self.pipeline.physical_key(k))
            .collect();
        self.client.batch_delete(physical_keys).await
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
        let client = Arc::clone(&self.client);
        let pipeline = self.pipeline.clone();
        let max_scan_limit = self.max_scan_limit;
        tracing::debug!(
            start = %Key(start.clone()),
            exclusive_end = %Key(exclusive_end.clone()),
            %limit,
            "scanning"
        );
        iterator::drive(sender, async move {
            if exclusive_end.is_empty() {
                return Ok(());
            }
            let physical_start = pipeline.physical_key(&start);
            let physical_end = pipeline.physical_key(&exclusive_end);
            let mut count = 0u64;
            Self::scan_slices(
                &client,
                &pipeline,
                &producer,
                physical_start,
                Some(physical_end),
                limit,
                options.key_only,
                max_scan_limit,
                &mut count,
            )
            .await?;
            Ok(())
        });
        iter
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let client = Arc::clone(&self.client);
        let pipeline = self.pipeline.clone();
        let max_scan_limit = self.max_scan_limit;
        tracing::debug!(prefix = %Key(prefix.clone()), %limit, "prefix scanning");
        iterator::drive(sender, async move {
            let physical_prefix = pipeline.physical_key(&prefix);
            let exclusive_end = prefix_successor(&physical_prefix);
            let mut count = 0u64;
            Self::scan_slices(
                &client,
                &pipeline,
                &producer,
                physical_prefix,
                exclusive_end,
                limit,
                options.key_only,
                max_scan_limit,
                &mut count,
            )
            .await?;
            Ok(())
        });
        iter
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let client = Arc::clone(&self.client);
        let pipeline = self.pipeline.clone();
        let max_scan_limit = self.max_scan_limit;
        tracing::debug!(prefix_count = prefixes.len(), %limit, "batch prefix scanning");
        iterator::drive(sender, async move {
            let mut count = 0u64;
            for prefix in prefixes {
                let physical_prefix = pipeline.physical_key(&prefix);
                let exclusive_end = prefix_successor(&physical_prefix);
                let keep_going = Self::scan_slices(
                    &client,
                    &pipeline,
                    &producer,
                    physical_prefix,
                    exclusive_end,
                    limit,
                    options.key_only,
                    max_scan_limit,
                    &mut count,
                )
                .await?;
                if !keep_going {
                    break;
                }
            }
            Ok(())
        });
        iter
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_empty_value: false,
            supports_delete: true,
        }
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRawKv;
    use crate::KvStore;

    fn store_with(config: TikvConfig, cluster: Arc<FakeRawKv>) -> TikvStore {
        TikvStore::new(cluster, config)
    }

    fn prefixed_config() -> TikvConfig {
        TikvConfig {
            key_prefix: Bytes::from_static(b"blk;"),
            ..TikvConfig::default()
        }
    }

    #[tokio::test]
    async fn should_namespace_physical_keys() {
        // given
        let cluster = Arc::new(FakeRawKv::new());
        let store = store_with(prefixed_config(), Arc::clone(&cluster));

        // when
        store
            .put(Bytes::from("key"), Bytes::from("value"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // then
        assert_eq!(
            store.get(Bytes::from("key")).await.unwrap(),
            Bytes::from("value")
        );
        assert!(cluster.contains(b"blk;key"));
    }

    #[tokio::test]
    async fn should_page_prefix_scan_through_small_slices() {
        // given: an engine that returns at most 2 rows per request
        let cluster = Arc::new(FakeRawKv::new());
        let config = TikvConfig {
            max_scan_limit: 2,
            ..prefixed_config()
        };
        let store = store_with(config, Arc::clone(&cluster));
        for n in 0..7u8 {
            store
                .put(Bytes::from(format!("k{}", n)), Bytes::from("v"))
                .await
                .unwrap();
        }
        store.flush_puts().await.unwrap();

        // when
        let items = store
            .prefix(Bytes::from("k"), Limit::UNBOUNDED, ReadOptions::default())
            .collect()
            .await
            .unwrap();

        // then: every row surfaced exactly once, in order
        assert_eq!(items.len(), 7);
        assert!(items.windows(2).all(|w| w[0].key < w[1].key));
        assert!(cluster.scan_calls() >= 4);
    }

    #[tokio::test]
    async fn should_cap_batch_prefix_across_prefixes() {
        // given
        let cluster = Arc::new(FakeRawKv::new());
        let store = store_with(TikvConfig::default(), cluster);
        for key in ["a1", "a2", "b1", "b2"] {
            store
                .put(Bytes::from(key), Bytes::from("v"))
                .await
                .unwrap();
        }
        store.flush_puts().await.unwrap();

        // when: the limit is global, not per prefix
        let items = store
            .batch_prefix(
                vec![Bytes::from("a"), Bytes::from("b")],
                Limit(3),
                ReadOptions::default(),
            )
            .collect()
            .await
            .unwrap();

        // then
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].key, Bytes::from("b1"));
    }

    #[tokio::test]
    async fn should_reject_empty_value_without_opt_in() {
        let cluster = Arc::new(FakeRawKv::new());
        let store = store_with(TikvConfig::default(), cluster);
        assert_eq!(
            store.put(Bytes::from("k"), Bytes::new()).await,
            Err(Error::EmptyValueRejected)
        );
    }

    #[tokio::test]
    async fn should_roundtrip_empty_value_through_sentinel() {
        // given: the engine itself refuses empty values
        let cluster = Arc::new(FakeRawKv::new());
        let config = TikvConfig {
            empty_values: EmptyValuePolicy::Encode,
            ..TikvConfig::default()
        };
        let store = store_with(config, Arc::clone(&cluster));

        // when
        store.put(Bytes::from("k"), Bytes::new()).await.unwrap();
        store.flush_puts().await.unwrap();

        // then: stored as the sentinel, surfaced as empty
        assert_eq!(store.get(Bytes::from("k")).await.unwrap(), Bytes::new());
        assert_eq!(cluster.raw_value(b"k").unwrap(), Bytes::from_static(&[0]));
    }

    #[tokio::test]
    async fn should_chunk_flush_by_pair_count() {
        // given
        let cluster = Arc::new(FakeRawKv::new());
        let config = TikvConfig {
            batch_pair_count: 2,
            ..TikvConfig::default()
        };
        let store = store_with(config, Arc::clone(&cluster));
        for n in 0..5u8 {
            store
                .put(Bytes::from(format!("k{}", n)), Bytes::from("v"))
                .await
                .unwrap();
        }

        // when
        store.flush_puts().await.unwrap();

        // then: 5 pairs in chunks of 2 take 3 requests
        assert_eq!(cluster.batch_put_calls(), 3);
    }

    #[tokio::test]
    async fn should_fail_batch_get_on_first_missing_key() {
        // given
        let cluster = Arc::new(FakeRawKv::new());
        let store = store_with(TikvConfig::default(), cluster);
        store
            .put(Bytes::from("present"), Bytes::from("v"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // when
        let result = store
            .batch_get(vec![Bytes::from("present"), Bytes::from("missing")])
            .collect()
            .await;

        // then
        assert_eq!(result, Err(Error::NotFound));
    }

    #[test]
    fn should_parse_dsn_config() {
        // given
        let dsn = Dsn::parse(
            "tikv://pd0,pd1:2379/blk?compression=zstd&compression_size_threshold=64&tikv_max_scan_limit=100",
        )
        .unwrap();

        // when
        let config = TikvConfig::from_dsn(&dsn, StoreOptions::default()).unwrap();

        // then
        assert_eq!(config.key_prefix, Bytes::from_static(b"blk;"));
        assert_eq!(config.compressor, Compressor::Zstd { threshold: 64 });
        assert_eq!(config.max_scan_limit, 100);
        assert_eq!(
            TikvConfig::endpoints(&dsn).unwrap(),
            vec!["pd0:2379".to_string(), "pd1:2379".to_string()]
        );
    }

    #[test]
    fn should_reject_short_table_prefix() {
        let dsn = Dsn::parse("tikv://pd0:2379/ab").unwrap();
        assert!(TikvConfig::from_dsn(&dsn, StoreOptions::default()).is_err());
    }
}
