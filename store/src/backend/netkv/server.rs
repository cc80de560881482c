//! The netkv server: exposes the storage contract over HTTP for any
//! registered backend.
//!
//! Request bodies are binary protobuf; streaming responses are
//! length-delimited [`KvFrame`](super::proto::KvFrame)s. Errors raised
//! before a stream starts map to HTTP statuses; errors mid-stream travel as
//! terminal frames.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use prost::Message;

use crate::error::{Error, Result};
use crate::iterator::KvIterator;
use crate::model::Limit;
use crate::options::ReadOptions;
use crate::KvStore;

use super::proto;
use super::wire;

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn KvStore>,
}

/// Serves the netkv protocol over one backend store.
pub struct NetKvServer {
    store: Arc<dyn KvStore>,
}

impl NetKvServer {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/kv/batch-put", post(handle_batch_put))
            .route("/api/v1/kv/batch-get", post(handle_batch_get))
            .route("/api/v1/kv/batch-delete", post(handle_batch_delete))
            .route("/api/v1/kv/scan", post(handle_scan))
            .route("/api/v1/kv/prefix", post(handle_prefix))
            .route("/api/v1/kv/batch-prefix", post(handle_batch_prefix))
            .with_state(AppState {
                store: Arc::clone(&self.store),
            })
    }

    /// Serves until the listener fails. The store is closed by the owner,
    /// not the server.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> Result<()> {
        let addr = listener.local_addr().map_err(Error::storage)?;
        tracing::info!(%addr, "netkv server listening");
        axum::serve(listener, self.router())
            .await
            .map_err(Error::storage)
    }
}

/// Error wrapper converting store errors to HTTP responses.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self.0 {
            Error::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            Error::EmptyValueRejected => (StatusCode::BAD_REQUEST, "empty_value"),
            Error::Canceled => (StatusCode::INTERNAL_SERVER_ERROR, "canceled"),
            Error::Storage(_) | Error::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        let body = serde_json::json!({
            "status": "error",
            "errorType": error_type,
            "error": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

fn decode_request<M: Message + Default>(body: &Bytes) -> std::result::Result<M, ApiError> {
    M::decode(body.as_ref())
        .map_err(|e| ApiError(Error::InvalidInput(format!("malformed request body: {}", e))))
}

fn read_options(options: Option<proto::ReadOptions>) -> ReadOptions {
    ReadOptions {
        key_only: options.map(|o| o.key_only).unwrap_or(false),
    }
}

/// Streams an iterator as length-delimited frames. The error latch, if it
/// fires, becomes the final frame.
fn stream_response(iter: KvIterator) -> Response {
    let stream = futures::stream::unfold(Some(iter), |state| async move {
        let mut iter = state?;
        if iter.next().await {
            let frame = wire::item_frame(iter.item().clone());
            return Some((Ok::<Bytes, Infallible>(wire::encode_frame(&frame)), Some(iter)));
        }
        iter.err().map(|err| {
            let frame = wire::error_frame(err);
            (Ok(wire::encode_frame(&frame)), None)
        })
    });

    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn handle_batch_put(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: proto::KeyValues = decode_request(&body)?;
    for kv in request.kvs {
        state.store.put(kv.key, kv.value).await?;
    }
    state.store.flush_puts().await?;
    Ok(StatusCode::OK)
}

async fn handle_batch_delete(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: proto::Keys = decode_request(&body)?;
    if request.keys.is_empty() {
        return Ok(StatusCode::OK);
    }
    state.store.batch_delete(request.keys).await?;
    Ok(StatusCode::OK)
}

/// Single-key requests resolve before the stream starts and answer
/// value-only; missing keys surface as a 404 status instead of a frame.
async fn handle_batch_get(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let request: proto::Keys = decode_request(&body)?;
    if request.keys.is_empty() {
        return Err(ApiError(Error::InvalidInput(
            "at least one key required for BatchGet".to_string(),
        )));
    }

    if request.keys.len() == 1 {
        let key = request.keys.into_iter().next().expect("length checked");
        let value = state.store.get(key).await?;
        let frame = wire::item_frame(crate::model::Kv {
            key: Bytes::new(),
            value,
        });
        return Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from(wire::encode_frame(&frame)),
        )
            .into_response());
    }

    Ok(stream_response(state.store.batch_get(request.keys)))
}

async fn handle_scan(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let request: proto::ScanRequest = decode_request(&body)?;
    let iter = state.store.scan(
        request.start,
        request.exclusive_end,
        Limit(request.limit),
        read_options(request.options),
    );
    Ok(stream_response(iter))
}

async fn handle_prefix(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let request: proto::PrefixRequest = decode_request(&body)?;
    let iter = state.store.prefix(
        request.prefix,
        Limit(request.limit),
        read_options(request.options),
    );
    Ok(stream_response(iter))
}

async fn handle_batch_prefix(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let request: proto::BatchPrefixRequest = decode_request(&body)?;
    let iter = state.store.batch_prefix(
        request.prefixes,
        Limit(request.limit_per_prefix),
        read_options(request.options),
    );
    Ok(stream_response(iter))
}
