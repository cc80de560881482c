//! Conformance scenarios every backend must pass, plus in-process fakes for
//! the cluster and wide-column client seams.
//!
//! Integration tests construct a fresh store per scenario and hand it to
//! the `run_*` functions; the scenarios seed their own records.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::backend::bigkv::table::{RowMutation, RowSet, WideColumnTable};
use crate::backend::tikv::client::RawKv;
use crate::error::{Error, Result};
use crate::model::{Kv, Limit};
use crate::options::ReadOptions;
use crate::purgeable::{deletion_key, PurgeableStore};
use crate::KvStore;

/// The seven seed records of the basic scenario. The last value is a
/// 91-byte blob so stores configured with a small compression threshold
/// exercise the compressed path.
pub fn seed_records() -> Vec<Kv> {
    let blob: Vec<u8> = (0..91u8).map(|i| b'a' + (i % 26)).collect();
    vec![
        Kv::new("a", "1"),
        Kv::new("ba", "2"),
        Kv::new("ba1", "3"),
        Kv::new("ba2", "4"),
        Kv::new("bb", "5"),
        Kv::new("c", "6"),
        Kv::new("g", blob),
    ]
}

async fn expect_prefix(store: &dyn KvStore, prefix: &[u8], limit: Limit, expected: &[Kv]) {
    let got = store
        .prefix(
            Bytes::copy_from_slice(prefix),
            limit,
            ReadOptions::default(),
        )
        .collect()
        .await
        .unwrap_or_else(|e| panic!("prefix {:?} failed: {}", prefix, e));
    assert_eq!(
        got, expected,
        "prefix {:?} with limit {} returned the wrong records",
        prefix, limit
    );
}

async fn expect_batch_prefix(
    store: &dyn KvStore,
    prefixes: &[&[u8]],
    limit: Limit,
    expected: &[Kv],
) {
    let got = store
        .batch_prefix(
            prefixes.iter().map(|p| Bytes::copy_from_slice(p)).collect(),
            limit,
            ReadOptions::default(),
        )
        .collect()
        .await
        .unwrap_or_else(|e| panic!("batch prefix {:?} failed: {}", prefixes, e));
    assert_eq!(
        got, expected,
        "batch prefix {:?} with limit {} returned the wrong records",
        prefixes, limit
    );
}

async fn expect_scan(
    store: &dyn KvStore,
    start: &[u8],
    exclusive_end: &[u8],
    limit: Limit,
    expected: &[Kv],
) {
    let got = store
        .scan(
            Bytes::copy_from_slice(start),
            Bytes::copy_from_slice(exclusive_end),
            limit,
            ReadOptions::default(),
        )
        .collect()
        .await
        .unwrap_or_else(|e| panic!("scan {:?}..{:?} failed: {}", start, exclusive_end, e));
    assert_eq!(
        got, expected,
        "scan {:?}..{:?} with limit {} returned the wrong records",
        start, exclusive_end, limit
    );
}

/// Round-trips, not-found, prefix and scan ordering and limits, batched
/// prefixes with a global cap, and deletion.
pub async fn run_basic(store: &dyn KvStore) {
    let all = seed_records();

    for kv in &all {
        store.put(kv.key.clone(), kv.value.clone()).await.unwrap();
    }
    store.flush_puts().await.unwrap();

    for kv in &all {
        let value = store.get(kv.key.clone()).await.unwrap();
        assert_eq!(value, kv.value, "get {:?}", kv.key);
    }

    assert_eq!(
        store.get(Bytes::from("keydoesnotexists")).await,
        Err(Error::NotFound)
    );

    // Prefix without limit.
    expect_prefix(store, b"", Limit::UNBOUNDED, &all).await;
    expect_prefix(store, b"a", Limit::UNBOUNDED, &all[..1]).await;
    expect_prefix(store, b"c", Limit::UNBOUNDED, &all[5..6]).await;
    expect_prefix(store, b"b", Limit::UNBOUNDED, &all[1..5]).await;
    expect_prefix(store, b"ba", Limit::UNBOUNDED, &all[1..4]).await;

    // Prefix with limit.
    expect_prefix(store, b"", Limit(2), &all[..2]).await;
    expect_prefix(store, b"", Limit(5), &all[..5]).await;
    expect_prefix(store, b"", Limit(10), &all).await;
    expect_prefix(store, b"a", Limit(2), &all[..1]).await;
    expect_prefix(store, b"c", Limit(1), &all[5..6]).await;
    expect_prefix(store, b"b", Limit(3), &all[1..4]).await;
    expect_prefix(store, b"ba", Limit(10), &all[1..4]).await;

    // Batch prefix without limit.
    expect_batch_prefix(store, &[b"ba" as &[u8]], Limit::UNBOUNDED, &all[1..4]).await;
    expect_batch_prefix(
        store,
        &[b"ba" as &[u8], b"c"],
        Limit::UNBOUNDED,
        &[
            all[1].clone(),
            all[2].clone(),
            all[3].clone(),
            all[5].clone(),
        ],
    )
    .await;
    expect_batch_prefix(
        store,
        &[b"a" as &[u8], b"c"],
        Limit::UNBOUNDED,
        &[all[0].clone(), all[5].clone()],
    )
    .await;
    expect_batch_prefix(store, &[b"d" as &[u8], b"f"], Limit::UNBOUNDED, &[]).await;

    // Batch prefix with a global limit.
    expect_batch_prefix(store, &[b"ba" as &[u8]], Limit(1), &all[1..2]).await;
    expect_batch_prefix(store, &[b"ba" as &[u8], b"c"], Limit(2), &all[1..3]).await;
    expect_batch_prefix(store, &[b"a" as &[u8], b"c"], Limit(1), &all[..1]).await;
    expect_batch_prefix(store, &[b"d" as &[u8], b"f"], Limit(10), &[]).await;

    // Scan without limit.
    expect_scan(store, b"a", b"a", Limit::UNBOUNDED, &[]).await;
    expect_scan(store, b"a", b"b", Limit::UNBOUNDED, &all[..1]).await;
    expect_scan(store, b"b", b"a", Limit::UNBOUNDED, &[]).await;
    expect_scan(store, b"b", b"bb", Limit::UNBOUNDED, &all[1..4]).await;
    expect_scan(store, b"b", b"c", Limit::UNBOUNDED, &all[1..5]).await;
    expect_scan(store, b"a", b"c", Limit::UNBOUNDED, &all[..5]).await;
    expect_scan(store, b"ba", b"bb", Limit::UNBOUNDED, &all[1..4]).await;
    expect_scan(store, b"", b"", Limit::UNBOUNDED, &[]).await;
    expect_scan(store, b"", b"c", Limit::UNBOUNDED, &all[..5]).await;
    expect_scan(store, b"b", b"", Limit::UNBOUNDED, &[]).await;

    // Scan with limit.
    expect_scan(store, b"a", b"a", Limit(100), &[]).await;
    expect_scan(store, b"a", b"b", Limit(1), &all[..1]).await;
    expect_scan(store, b"b", b"a", Limit(10), &[]).await;
    expect_scan(store, b"b", b"bb", Limit(1), &all[1..2]).await;
    expect_scan(store, b"b", b"bb", Limit(2), &all[1..3]).await;
    expect_scan(store, b"b", b"bb", Limit(3), &all[1..4]).await;
    expect_scan(store, b"b", b"bb", Limit(4), &all[1..4]).await;
    expect_scan(store, b"", b"", Limit(10), &[]).await;
    expect_scan(store, b"", b"c", Limit(1), &all[..1]).await;
    expect_scan(store, b"", b"c", Limit(3), &all[..3]).await;
    expect_scan(store, b"b", b"", Limit(1), &[]).await;

    // Deletion is idempotent and total.
    let keys: Vec<Bytes> = all.iter().map(|kv| kv.key.clone()).collect();
    store.batch_delete(keys.clone()).await.unwrap();
    for key in keys {
        assert_eq!(
            store.get(key.clone()).await,
            Err(Error::NotFound),
            "key {:?} survived deletion",
            key
        );
    }
}

/// Empty-value behavior against the store's capability and opt-in state.
pub async fn run_empty_value(store: &dyn KvStore, opted_in: bool) {
    let key = Bytes::from("randomkey");
    let can_add = opted_in || store.capabilities().supports_empty_value;

    let put_result = store.put(key.clone(), Bytes::new()).await;
    if can_add {
        put_result.unwrap();
    } else {
        assert_eq!(put_result, Err(Error::EmptyValueRejected));
    }

    store.flush_puts().await.unwrap();

    let got = store.get(key.clone()).await;
    if can_add {
        assert_eq!(got.unwrap(), Bytes::new());
    } else {
        assert_eq!(got, Err(Error::NotFound));
    }

    let batch = store.batch_get(vec![key.clone()]).collect().await;
    if can_add {
        let items = batch.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, key);
        assert_eq!(items[0].value, Bytes::new());
    } else {
        assert_eq!(batch, Err(Error::NotFound));
    }
}

/// Batch gets preserve input order and fail on the first missing key.
pub async fn run_batch_get(store: &dyn KvStore) {
    for kv in seed_records() {
        store.put(kv.key, kv.value).await.unwrap();
    }
    store.flush_puts().await.unwrap();

    // Input order is not key order.
    let items = store
        .batch_get(vec![Bytes::from("c"), Bytes::from("a"), Bytes::from("bb")])
        .collect()
        .await
        .unwrap();
    let keys: Vec<&[u8]> = items.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"c".as_ref(), b"a", b"bb"]);
    assert_eq!(items[0].value, Bytes::from("6"));
    assert_eq!(items[1].value, Bytes::from("1"));

    // Not finding a key is fatal and interrupts the resultset.
    let result = store
        .batch_get(vec![Bytes::from("a"), Bytes::from("nope"), Bytes::from("c")])
        .collect()
        .await;
    assert_eq!(result, Err(Error::NotFound));
}

/// Key-only reads surface keys with empty values.
pub async fn run_key_only(store: &dyn KvStore) {
    for kv in seed_records() {
        store.put(kv.key, kv.value).await.unwrap();
    }
    store.flush_puts().await.unwrap();

    let items = store
        .prefix(Bytes::from("ba"), Limit::UNBOUNDED, ReadOptions::key_only())
        .collect()
        .await
        .unwrap();
    let keys: Vec<&[u8]> = items.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"ba".as_ref(), b"ba1", b"ba2"]);
    assert!(items.iter().all(|kv| kv.value.is_empty()));

    let items = store
        .scan(
            Bytes::from("a"),
            Bytes::from("c"),
            Limit(2),
            ReadOptions::key_only(),
        )
        .collect()
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|kv| kv.value.is_empty()));
}

/// Tripping the iterator's cancellation token terminates it with
/// [`Error::Canceled`] in bounded time.
pub async fn run_cancellation(store: &dyn KvStore) {
    // Enough records to overflow the iterator buffer and block the
    // producer mid-stream.
    for n in 0..300u32 {
        store
            .put(
                Bytes::from(format!("cancel/{:04}", n)),
                Bytes::from("v"),
            )
            .await
            .unwrap();
    }
    store.flush_puts().await.unwrap();

    let mut iter = store.prefix(
        Bytes::from("cancel/"),
        Limit::UNBOUNDED,
        ReadOptions::default(),
    );
    assert!(iter.next().await);

    iter.cancellation().cancel();
    while iter.next().await {}
    assert_eq!(iter.err(), Some(&Error::Canceled));
}

/// The purge scenario of the purgeable overlay: records written at heights
/// below the sliding window disappear along with their markers.
pub async fn run_purgeable(store: &PurgeableStore, table_prefix: &[u8], ttl: u64) {
    let writes: Vec<(Bytes, Bytes, u64)> = vec![
        (Bytes::from("a"), Bytes::from("1"), 90),
        (Bytes::from("ba"), Bytes::from("2"), 80),
        (Bytes::from("ba1"), Bytes::from("3"), 92),
        (Bytes::from("ba2"), Bytes::from("4"), 94),
        (Bytes::from("bb"), Bytes::from("5"), 1085),
        (Bytes::from("c"), Bytes::from("6"), 96),
    ];

    for (key, value, height) in &writes {
        store.mark_current_height(*height);
        store.put(key.clone(), value.clone()).await.unwrap();
    }
    store.flush_puts().await.unwrap();

    // Records and their markers are in place.
    for (key, value, height) in &writes {
        assert_eq!(&store.get(key.clone()).await.unwrap(), value);
        let marker = deletion_key(table_prefix, *height, key);
        assert_eq!(
            store.get(marker).await.unwrap(),
            Bytes::from_static(&[0x00])
        );
    }

    let purge_height = 92u64;
    store.mark_current_height(purge_height);
    store.purge_keys().await.unwrap();

    for (key, value, height) in &writes {
        let got = store.get(key.clone()).await;
        let marker = store.get(deletion_key(table_prefix, *height, key)).await;
        if *height < purge_height - ttl {
            assert_eq!(got, Err(Error::NotFound), "key {:?} should be purged", key);
            assert_eq!(marker, Err(Error::NotFound), "marker of {:?} should be purged", key);
        } else {
            assert_eq!(&got.unwrap(), value, "key {:?} should survive", key);
            marker.unwrap();
        }
    }
}

/// In-process raw KV cluster double: rejects empty values and caps scans
/// like the real engine, and counts requests so tests can assert the
/// slicing and chunking behavior.
pub struct FakeRawKv {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    scan_calls: AtomicUsize,
    batch_put_calls: AtomicUsize,
}

impl FakeRawKv {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            scan_calls: AtomicUsize::new(0),
            batch_put_calls: AtomicUsize::new(0),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.raw_value(key).is_some()
    }

    /// The stored physical value, transforms included.
    pub fn raw_value(&self, key: &[u8]) -> Option<Bytes> {
        self.data
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::Relaxed)
    }

    pub fn batch_put_calls(&self) -> usize {
        self.batch_put_calls.load(Ordering::Relaxed)
    }
}

impl Default for FakeRawKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RawKv for FakeRawKv {
    async fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
        Ok(self.raw_value(&key))
    }

    async fn batch_put(&self, pairs: Vec<Kv>) -> Result<()> {
        self.batch_put_calls.fetch_add(1, Ordering::Relaxed);
        if pairs.iter().any(|kv| kv.value.is_empty()) {
            return Err(Error::Storage("empty value is not allowed".to_string()));
        }
        let mut data = self.data.write().expect("lock poisoned");
        for kv in pairs {
            data.insert(kv.key, kv.value);
        }
        Ok(())
    }

    async fn scan(
        &self,
        start: Bytes,
        exclusive_end: Option<Bytes>,
        limit: u32,
    ) -> Result<Vec<Kv>> {
        self.scan_calls.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().expect("lock poisoned");
        let rows: Vec<Kv> = match exclusive_end {
            Some(end) => {
                if start >= end {
                    return Ok(Vec::new());
                }
                data.range(start..end)
                    .take(limit as usize)
                    .map(|(k, v)| Kv::new(k.clone(), v.clone()))
                    .collect()
            }
            None => data
                .range(start..)
                .take(limit as usize)
                .map(|(k, v)| Kv::new(k.clone(), v.clone()))
                .collect(),
        };
        Ok(rows)
    }

    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()> {
        let mut data = self.data.write().expect("lock poisoned");
        for key in keys {
            data.remove(&key);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process wide-column table double: latest-value rows, native row-range
/// reads in table order, strip-value support, and a read-request counter.
pub struct FakeWideColumnTable {
    data: RwLock<BTreeMap<Bytes, Bytes>>,
    read_rows_calls: AtomicUsize,
}

impl FakeWideColumnTable {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            read_rows_calls: AtomicUsize::new(0),
        }
    }

    pub fn read_rows_calls(&self) -> usize {
        self.read_rows_calls.load(Ordering::Relaxed)
    }
}

impl Default for FakeWideColumnTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WideColumnTable for FakeWideColumnTable {
    async fn read_row(&self, key: Bytes) -> Result<Option<Bytes>> {
        Ok(self.data.read().expect("lock poisoned").get(&key).cloned())
    }

    async fn read_rows(&self, set: RowSet, limit: Limit, strip_values: bool) -> Result<Vec<Kv>> {
        self.read_rows_calls.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read().expect("lock poisoned");

        // Rows come back in table order regardless of how they were
        // addressed, like the real engine.
        let mut rows: BTreeMap<Bytes, Bytes> = BTreeMap::new();
        match set {
            RowSet::Keys(keys) => {
                for key in keys {
                    if let Some(value) = data.get(&key) {
                        rows.insert(key, value.clone());
                    }
                }
            }
            RowSet::Ranges(ranges) => {
                for range in ranges {
                    match range.exclusive_end {
                        Some(end) => {
                            if range.start >= end {
                                continue;
                            }
                            for (k, v) in data.range(range.start.clone()..end) {
                                rows.insert(k.clone(), v.clone());
                            }
                        }
                        None => {
                            for (k, v) in data.range(range.start.clone()..) {
                                rows.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut out: Vec<Kv> = rows
            .into_iter()
            .map(|(key, value)| {
                let value = if strip_values { Bytes::new() } else { value };
                Kv { key, value }
            })
            .collect();
        if limit.bounded() {
            out.truncate(limit.0 as usize);
        }
        Ok(out)
    }

    async fn apply_bulk(&self, mutations: Vec<RowMutation>) -> Result<()> {
        let mut data = self.data.write().expect("lock poisoned");
        for m in mutations {
            match m {
                RowMutation::Set { key, value } => {
                    data.insert(key, value);
                }
                RowMutation::DeleteRow { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
