//! Managed wide-column cloud store backend.
//!
//! Values live in a single column family with a most-recent-version
//! retention policy. Scans map to row ranges, prefix scans to prefix
//! ranges, and `batch_prefix` to a row-range list served by one native
//! request. Bulk mutations flush in chunks bounded by both the configured
//! thresholds and the client's natural per-request limits.

pub mod table;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::Batch;
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::iterator::{self, KvIterator};
use crate::model::{prefix_successor, Kv, Limit};
use crate::options::{Capabilities, ReadOptions, StoreOptions};
use crate::pipeline::Pipeline;

use self::table::{RowMutation, RowRange, RowSet, WideColumnTable};

/// Natural per-request limits of the cloud client's bulk mutation path.
const MAX_MUTATION_ROWS: usize = 85_000;
const MAX_MUTATION_BYTES: usize = 85_000_000;

/// Configuration derived from a `bigkv://` DSN.
#[derive(Debug, Clone)]
pub struct BigKvConfig {
    pub project: String,
    pub instance: String,
    pub table: String,
    pub create_table: bool,
    pub key_prefix: Bytes,
    pub family: String,
    pub qualifier: String,
    pub max_bytes_before_flush: usize,
    pub max_rows_before_flush: usize,
    pub max_seconds_before_flush: Duration,
}

impl BigKvConfig {
    /// Parses `bigkv://project.instance/<table>?<options>`.
    ///
    /// The host must be exactly `project.instance`. `colName` takes the
    /// form `family:column`; a malformed value fails fast.
    pub fn from_dsn(dsn: &Dsn, _options: StoreOptions) -> Result<Self> {
        let host = dsn.host_str().unwrap_or_default();
        let parts: Vec<&str> = host.split('.').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::InvalidInput(format!(
                "dsn {:?} invalid, ensure the host component looks like 'project.instance'",
                dsn.as_str()
            )));
        }

        let table = dsn.path_segment().to_string();
        if table.is_empty() {
            return Err(Error::InvalidInput(format!(
                "dsn {:?} is missing a table name",
                dsn.as_str()
            )));
        }

        let col_name = dsn.option("colName").unwrap_or_else(|| "kv:v".to_string());
        let col_parts: Vec<&str> = col_name.split(':').collect();
        if col_parts.len() != 2 || col_parts[0].is_empty() || col_parts[1].is_empty() {
            return Err(Error::InvalidInput(format!(
                "colName {:?} invalid, expected 'family:column'",
                col_name
            )));
        }

        Ok(Self {
            project: parts[0].to_string(),
            instance: parts[1].to_string(),
            table,
            create_table: dsn.bool_option("createTable"),
            key_prefix: dsn.hex_option("keyPrefix")?.unwrap_or_default(),
            family: col_parts[0].to_string(),
            qualifier: col_parts[1].to_string(),
            max_bytes_before_flush: dsn.usize_option("maxBytesBeforeFlush", 70_000_000)?,
            max_rows_before_flush: dsn.usize_option("maxRowsBeforeFlush", 0)?,
            max_seconds_before_flush: dsn
                .seconds_option("maxSecondsBeforeFlush", Duration::from_secs(10))?,
        })
    }
}

pub struct BigKvStore {
    table: Arc<dyn WideColumnTable>,
    pipeline: Pipeline,
    batch: Mutex<Batch>,
}

impl BigKvStore {
    pub fn new(table: Arc<dyn WideColumnTable>, config: &BigKvConfig) -> Self {
        Self {
            table,
            pipeline: Pipeline::new(
                config.key_prefix.clone(),
                crate::compression::Compressor::NoOp,
                crate::pipeline::EmptyValuePolicy::Native,
            ),
            batch: Mutex::new(Batch::new(
                config.max_bytes_before_flush,
                config.max_rows_before_flush,
                config.max_seconds_before_flush,
            )),
        }
    }

    fn lock_batch(&self) -> Result<std::sync::MutexGuard<'_, Batch>> {
        self.batch
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Chunks mutations under the client's natural per-request limits.
    async fn apply_chunked(&self, mutations: Vec<RowMutation>) -> Result<()> {
        let mut current: Vec<RowMutation> = Vec::new();
        let mut current_bytes = 0usize;
        for m in mutations {
            let over_rows = current.len() >= MAX_MUTATION_ROWS;
            let over_bytes = current_bytes + m.size() > MAX_MUTATION_BYTES;
            if !current.is_empty() && (over_rows || over_bytes) {
                self.table.apply_bulk(std::mem::take(&mut current)).await?;
                current_bytes = 0;
            }
            current_bytes += m.size();
            current.push(m);
        }
        if !current.is_empty() {
            self.table.apply_bulk(current).await?;
        }
        Ok(())
    }

    fn spawn_read(
        &self,
        set: RowSet,
        limit: Limit,
        options: ReadOptions,
        reorder_prefixes: Option<Vec<Bytes>>,
    ) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let table = Arc::clone(&self.table);
        let pipeline = self.pipeline.clone();
        iterator::drive(sender, async move {
            let rows = table.read_rows(set, limit, options.key_only).await?;

            let rows = match reorder_prefixes {
                None => rows,
                Some(physical_prefixes) => regroup_by_prefix(rows, &physical_prefixes),
            };

            for kv in rows {
                let key = pipeline.logical_key(kv.key);
                let value = if options.key_only {
                    Bytes::new()
                } else {
                    pipeline.decode_value(kv.value)?
                };
                if !producer.push_item(Kv { key, value }).await {
                    break;
                }
            }
            Ok(())
        });
        iter
    }
}

/// Reorders one native response into input-prefix order: all matches of the
/// first prefix ascending, then the second, and so on. Each row is emitted
/// once, under its first matching prefix.
fn regroup_by_prefix(rows: Vec<Kv>, prefixes: &[Bytes]) -> Vec<Kv> {
    let mut buckets: Vec<Vec<Kv>> = prefixes.iter().map(|_| Vec::new()).collect();
    for kv in rows {
        if let Some(idx) = prefixes.iter().position(|p| kv.key.starts_with(p)) {
            buckets[idx].push(kv);
        }
    }
    buckets.into_iter().flatten().collect()
}

#[async_trait]
impl crate::KvStore for BigKvStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let physical_key = self.pipeline.physical_key(&key);
        let physical_value = self.pipeline.encode_value(value)?;

        // Never let one bulk request grow past the client's natural limits.
        let flush_first = {
            let batch = self.lock_batch()?;
            !batch.is_empty()
                && (batch.len() + 1 > MAX_MUTATION_ROWS
                    || batch.size() + physical_key.len() + physical_value.len()
                        > MAX_MUTATION_BYTES)
        };
        if flush_first {
            tracing::debug!("mutation limits reached, flushing early");
            self.flush_puts().await?;
        }

        let should_flush = {
            let mut batch = self.lock_batch()?;
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
            let mut batch = self.lock_batch()?;
            batch.take()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let mutations = pending
            .into_iter()
            .map(|kv| RowMutation::Set {
                key: kv.key,
                value: kv.value,
            })
            .collect();
        self.apply_chunked(mutations).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> Result<Bytes> {
        let physical_key = self.pipeline.physical_key(&key);
        match self.table.read_row(physical_key).await? {
            Some(value) => self.pipeline.decode_value(value),
            None => Err(Error::NotFound),
        }
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let table = Arc::clone(&self.table);
        let pipeline = self.pipeline.clone();
        tracing::debug!(key_count = keys.len(), "batch get");
        iterator::drive(sender, async move {
            let physical_keys: Vec<Bytes> =
                keys.iter().map(|k| pipeline.physical_key(k)).collect();
            let rows = table
                .read_rows(RowSet::Keys(physical_keys.clone()), Limit::UNBOUNDED, false)
                .await?;

            // The engine returns rows in key order; re-emit in input order
            // and fail on the first missing key.
            let mut by_key: std::collections::HashMap<Bytes, Bytes> =
                rows.into_iter().map(|kv| (kv.key, kv.value)).collect();
            for (logical, physical) in keys.into_iter().zip(physical_keys) {
                let value = by_key.remove(&physical).ok_or(Error::NotFound)?;
                let value = pipeline.decode_value(value)?;
                if !producer
                    .push_item(Kv {
                        key: logical,
                        value,
                    })
                    .await
                {
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
        let mutations = keys
            .into_iter()
            .map(|key| RowMutation::DeleteRow {
                key: self.pipeline.physical_key(&key),
            })
            .collect();
        self.apply_chunked(mutations).await
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
        let range = RowRange {
            start: self.pipeline.physical_key(&start),
            exclusive_end: Some(self.pipeline.physical_key(&exclusive_end)),
        };
        self.spawn_read(RowSet::Ranges(vec![range]), limit, options, None)
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        let physical_prefix = self.pipeline.physical_key(&prefix);
        let range = RowRange {
            exclusive_end: prefix_successor(&physical_prefix),
            start: physical_prefix,
        };
        self.spawn_read(RowSet::Ranges(vec![range]), limit, options, None)
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        let physical_prefixes: Vec<Bytes> = prefixes
            .iter()
            .map(|p| self.pipeline.physical_key(p))
            .collect();
        let ranges = physical_prefixes
            .iter()
            .map(|p| RowRange {
                start: p.clone(),
                exclusive_end: prefix_successor(p),
            })
            .collect();
        self.spawn_read(
            RowSet::Ranges(ranges),
            limit,
            options,
            Some(physical_prefixes),
        )
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_empty_value: true,
            supports_delete: true,
        }
    }

    async fn close(&self) -> Result<()> {
        self.table.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeWideColumnTable;
    use crate::KvStore;

    fn test_config() -> BigKvConfig {
        let dsn = Dsn::parse("bigkv://dev.dev/test-table").unwrap();
        BigKvConfig::from_dsn(&dsn, StoreOptions::default()).unwrap()
    }

    fn test_store(table: Arc<FakeWideColumnTable>) -> BigKvStore {
        BigKvStore::new(table, &test_config())
    }

    #[tokio::test]
    async fn should_roundtrip_and_delete_rows() {
        // given
        let table = Arc::new(FakeWideColumnTable::new());
        let store = test_store(table);
        store
            .put(Bytes::from("k"), Bytes::from("v"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();
        assert_eq!(store.get(Bytes::from("k")).await.unwrap(), Bytes::from("v"));

        // when
        store.batch_delete(vec![Bytes::from("k")]).await.unwrap();

        // then
        assert_eq!(store.get(Bytes::from("k")).await, Err(Error::NotFound));
    }

    #[tokio::test]
    async fn should_serve_batch_prefix_with_one_native_request() {
        // given
        let table = Arc::new(FakeWideColumnTable::new());
        let store = test_store(Arc::clone(&table));
        for key in ["a1", "b1", "b2", "c1"] {
            store
                .put(Bytes::from(key), Bytes::from("v"))
                .await
                .unwrap();
        }
        store.flush_puts().await.unwrap();

        // when
        let items = store
            .batch_prefix(
                vec![Bytes::from("b"), Bytes::from("a")],
                Limit::UNBOUNDED,
                ReadOptions::default(),
            )
            .collect()
            .await
            .unwrap();

        // then: one request, results regrouped to input-prefix order
        assert_eq!(table.read_rows_calls(), 1);
        let keys: Vec<&[u8]> = items.iter().map(|kv| kv.key.as_ref()).collect();
        assert_eq!(keys, vec![b"b1".as_ref(), b"b2", b"a1"]);
    }

    #[tokio::test]
    async fn should_emit_batch_get_in_input_order() {
        // given
        let table = Arc::new(FakeWideColumnTable::new());
        let store = test_store(table);
        for key in ["x", "y"] {
            store
                .put(Bytes::from(key), Bytes::from(format!("{}v", key)))
                .await
                .unwrap();
        }
        store.flush_puts().await.unwrap();

        // when: input order differs from key order
        let items = store
            .batch_get(vec![Bytes::from("y"), Bytes::from("x")])
            .collect()
            .await
            .unwrap();

        // then
        assert_eq!(items[0].key, Bytes::from("y"));
        assert_eq!(items[1].key, Bytes::from("x"));
    }

    #[tokio::test]
    async fn should_strip_values_on_key_only_reads() {
        // given
        let table = Arc::new(FakeWideColumnTable::new());
        let store = test_store(table);
        store
            .put(Bytes::from("k"), Bytes::from("value"))
            .await
            .unwrap();
        store.flush_puts().await.unwrap();

        // when
        let items = store
            .prefix(Bytes::from("k"), Limit::UNBOUNDED, ReadOptions::key_only())
            .collect()
            .await
            .unwrap();

        // then
        assert_eq!(items.len(), 1);
        assert!(items[0].value.is_empty());
    }

    #[test]
    fn should_parse_dsn() {
        // given
        let dsn = Dsn::parse(
            "bigkv://proj.inst/tbl?createTable=true&keyPrefix=09&colName=data:payload&maxRowsBeforeFlush=100",
        )
        .unwrap();

        // when
        let config = BigKvConfig::from_dsn(&dsn, StoreOptions::default()).unwrap();

        // then
        assert_eq!(config.project, "proj");
        assert_eq!(config.instance, "inst");
        assert_eq!(config.table, "tbl");
        assert!(config.create_table);
        assert_eq!(config.key_prefix, Bytes::from_static(&[0x09]));
        assert_eq!(config.family, "data");
        assert_eq!(config.qualifier, "payload");
        assert_eq!(config.max_rows_before_flush, 100);
    }

    #[test]
    fn should_reject_malformed_host_and_col_name() {
        let flat_host = Dsn::parse("bigkv://justproject/tbl").unwrap();
        assert!(BigKvConfig::from_dsn(&flat_host, StoreOptions::default()).is_err());

        let bad_col = Dsn::parse("bigkv://p.i/tbl?colName=nodelimiter").unwrap();
        assert!(BigKvConfig::from_dsn(&bad_col, StoreOptions::default()).is_err());
    }
}
