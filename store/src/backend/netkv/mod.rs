//! Networked proxy backend.
//!
//! The client half of the netkv protocol: puts stage locally and flush as
//! one `BatchPut`, reads stream length-delimited frames from the server.
//! The server half lives in [`server`].

pub mod proto;
pub mod server;
pub mod wire;

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;

use crate::batch::Batch;
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::iterator::{self, IteratorSender, KvIterator};
use crate::model::{Kv, Limit};
use crate::options::{Capabilities, ReadOptions, StoreOptions};

pub use server::NetKvServer;

pub struct NetKvStore {
    http: reqwest::Client,
    base_url: String,
    batch: Mutex<Batch>,
}

impl NetKvStore {
    /// Opens a client from a `netkv://host:port?insecure=bool` DSN.
    ///
    /// `insecure=true` speaks plain HTTP; anything else uses TLS.
    pub fn open(dsn: &Dsn, _options: StoreOptions) -> Result<Self> {
        let host = dsn.host_str().ok_or_else(|| {
            Error::InvalidInput(format!("netkv dsn {:?} is missing a host", dsn.as_str()))
        })?;
        let scheme = if dsn.bool_option("insecure") {
            "http"
        } else {
            "https"
        };
        let base_url = match dsn.port() {
            Some(port) => format!("{}://{}:{}", scheme, host, port),
            None => format!("{}://{}", scheme, host),
        };

        let batch = Batch::new(
            dsn.usize_option("batch_size_threshold", 0)?,
            dsn.usize_option("batch_ops_threshold", 0)?,
            dsn.seconds_option("batch_time_threshold", std::time::Duration::ZERO)?,
        );
        Ok(Self::with_batch(base_url, batch))
    }

    /// A client against an explicit base URL, e.g. `http://127.0.0.1:9000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_batch(base_url.into(), Batch::unbounded())
    }

    fn with_batch(base_url: String, batch: Batch) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            batch: Mutex::new(batch),
        }
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/api/v1/kv/{}", self.base_url, op)
    }

    /// Posts one request and maps non-success statuses back to store
    /// errors.
    async fn post(
        http: &reqwest::Client,
        url: String,
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let response = http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/protobuf")
            .body(body)
            .send()
            .await
            .map_err(Error::storage)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status {
            reqwest::StatusCode::NOT_FOUND => Error::NotFound,
            reqwest::StatusCode::BAD_REQUEST => Error::InvalidInput(message),
            _ => Error::Storage(format!("server responded {}: {}", status, message)),
        })
    }

    /// Streams a framed response into an iterator, observing the consumer's
    /// cancellation between chunks and while blocked on a full channel.
    async fn stream_frames(
        http: reqwest::Client,
        url: String,
        body: Vec<u8>,
        producer: IteratorSender,
        fill_key: Option<Bytes>,
    ) -> Result<()> {
        let cancel = producer.cancellation();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Canceled),
            response = Self::post(&http, url, body) => response?,
        };

        let mut chunks = response.bytes_stream();
        let mut decoder = wire::FrameDecoder::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                chunk = chunks.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            decoder.feed(&chunk.map_err(Error::storage)?);

            while let Some(frame) = decoder.next_frame()? {
                if let Some(err) = wire::frame_error(&frame) {
                    return Err(err);
                }
                let Some(kv) = frame.kv else { continue };
                let key = match (&fill_key, kv.key.is_empty()) {
                    // Single-key responses are value-only; restore the key.
                    (Some(requested), true) => requested.clone(),
                    _ => kv.key,
                };
                if !producer.push_item(Kv { key, value: kv.value }).await {
                    return Ok(());
                }
            }
        }
        if !decoder.is_drained() {
            return Err(Error::Storage(
                "response stream ended mid-frame".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_stream(
        &self,
        op: &str,
        body: Vec<u8>,
        fill_key: Option<Bytes>,
    ) -> KvIterator {
        let (sender, iter) = iterator::channel();
        let producer = sender.clone();
        let http = self.http.clone();
        let url = self.endpoint(op);
        iterator::drive(sender, async move {
            Self::stream_frames(http, url, body, producer, fill_key).await
        });
        iter
    }
}

#[async_trait]
impl crate::KvStore for NetKvStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn put(&self, key: Bytes, value: Bytes) -> Result<()> {
        let should_flush = {
            let mut batch = self
                .batch
                .lock()
                .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?;
            batch.op(key, value);
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

        let body = proto::KeyValues {
            kvs: pending
                .into_iter()
                .map(|kv| proto::KeyValue {
                    key: kv.key,
                    value: kv.value,
                })
                .collect(),
        };
        Self::post(
            &self.http,
            self.endpoint("batch-put"),
            body.encode_to_vec(),
        )
        .await?;
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get(&self, key: Bytes) -> Result<Bytes> {
        let body = proto::Keys {
            keys: vec![key],
        };
        let response = Self::post(
            &self.http,
            self.endpoint("batch-get"),
            body.encode_to_vec(),
        )
        .await?;

        // Single-key responses carry exactly one value-only frame.
        let payload = response.bytes().await.map_err(Error::storage)?;
        let mut decoder = wire::FrameDecoder::new();
        decoder.feed(&payload);
        let frame = decoder
            .next_frame()?
            .ok_or_else(|| Error::Storage("empty single-key response".to_string()))?;
        if let Some(err) = wire::frame_error(&frame) {
            return Err(err);
        }
        frame
            .kv
            .map(|kv| kv.value)
            .ok_or_else(|| Error::Storage("single-key response frame has no value".to_string()))
    }

    fn batch_get(&self, keys: Vec<Bytes>) -> KvIterator {
        let fill_key = if keys.len() == 1 {
            Some(keys[0].clone())
        } else {
            None
        };
        let body = proto::Keys { keys };
        self.spawn_stream("batch-get", body.encode_to_vec(), fill_key)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn batch_delete(&self, keys: Vec<Bytes>) -> Result<()> {
        let body = proto::Keys { keys };
        Self::post(
            &self.http,
            self.endpoint("batch-delete"),
            body.encode_to_vec(),
        )
        .await?;
        Ok(())
    }

    fn scan(
        &self,
        start: Bytes,
        exclusive_end: Bytes,
        limit: Limit,
        options: ReadOptions,
    ) -> KvIterator {
        let body = proto::ScanRequest {
            start,
            exclusive_end,
            limit: limit.0,
            options: Some(proto::ReadOptions {
                key_only: options.key_only,
            }),
        };
        self.spawn_stream("scan", body.encode_to_vec(), None)
    }

    fn prefix(&self, prefix: Bytes, limit: Limit, options: ReadOptions) -> KvIterator {
        let body = proto::PrefixRequest {
            prefix,
            limit: limit.0,
            options: Some(proto::ReadOptions {
                key_only: options.key_only,
            }),
        };
        self.spawn_stream("prefix", body.encode_to_vec(), None)
    }

    fn batch_prefix(&self, prefixes: Vec<Bytes>, limit: Limit, options: ReadOptions) -> KvIterator {
        let body = proto::BatchPrefixRequest {
            prefixes,
            limit_per_prefix: limit.0,
            options: Some(proto::ReadOptions {
                key_only: options.key_only,
            }),
        };
        self.spawn_stream("batch-prefix", body.encode_to_vec(), None)
    }

    /// The proxy forwards whatever the server-side backend supports; the
    /// common deployment proxies stores with both capabilities.
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
