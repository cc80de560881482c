//! The raw key-value cluster client seam.
//!
//! The driver talks to the cluster through [`RawKv`]; transport setup is an
//! external concern. The production binding over `tikv-client` lives behind
//! the `tikv` feature, and tests drive the same seam with an in-process
//! fake.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::model::Kv;

/// The subset of a raw KV cluster client the driver relies on.
///
/// All keys and values here are physical: prefixing and value encoding have
/// already been applied by the driver.
#[async_trait]
pub trait RawKv: Send + Sync + 'static {
    async fn get(&self, key: Bytes) -> Result<Option<Bytes>>;

    /// Writes all pairs in one request. The engine rejects empty values.
    async fn batch_put(&self, pairs: Vec<Kv>) -> Result<()>;

    /// Scans `[start, exclusive_end)` ascending, at most `limit` pairs.
    /// `exclusive_end = None` is unbounded above. The engine caps `limit`
    /// at its max-per-request scan size.
    async fn scan(&self, start: Bytes, exclusive_end: Option<Bytes>, limit: u32) -> Result<Vec<Kv>>;

    /// Deletes all keys, atomically at the client level.
    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(feature = "tikv")]
pub use production::TikvRawClient;

#[cfg(feature = "tikv")]
mod production {
    use super::*;
    use crate::error::Error;

    /// Production binding over the official cluster client.
    pub struct TikvRawClient {
        inner: tikv_client::RawClient,
    }

    impl TikvRawClient {
        pub async fn connect(pd_endpoints: Vec<String>) -> Result<Self> {
            let inner = tikv_client::RawClient::new(pd_endpoints)
                .await
                .map_err(Error::storage)?;
            Ok(Self { inner })
        }
    }

    #[async_trait]
    impl RawKv for TikvRawClient {
        async fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
            let value = self
                .inner
                .get(key.to_vec())
                .await
                .map_err(Error::storage)?;
            Ok(value.map(Bytes::from))
        }

        async fn batch_put(&self, pairs: Vec<Kv>) -> Result<()> {
            let pairs: Vec<(Vec<u8>, Vec<u8>)> = pairs
                .into_iter()
                .map(|kv| (kv.key.to_vec(), kv.value.to_vec()))
                .collect();
            self.inner.batch_put(pairs).await.map_err(Error::storage)
        }

        async fn scan(
            &self,
            start: Bytes,
            exclusive_end: Option<Bytes>,
            limit: u32,
        ) -> Result<Vec<Kv>> {
            let pairs = match exclusive_end {
                Some(end) => self
                    .inner
                    .scan(start.to_vec()..end.to_vec(), limit)
                    .await
                    .map_err(Error::storage)?,
                None => self
                    .inner
                    .scan(start.to_vec().., limit)
                    .await
                    .map_err(Error::storage)?,
            };
            Ok(pairs
                .into_iter()
                .map(|pair| {
                    let (key, value): (tikv_client::Key, Vec<u8>) = pair.into();
                    let key: Vec<u8> = key.into();
                    Kv::new(key, value)
                })
                .collect())
        }

        async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()> {
            let keys: Vec<Vec<u8>> = keys.into_iter().map(|k| k.to_vec()).collect();
            self.inner.batch_delete(keys).await.map_err(Error::storage)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }
}
