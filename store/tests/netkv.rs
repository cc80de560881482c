//! End-to-end tests for the netkv proxy: a real server over a memory
//! backend, exercised through the client store.

use std::sync::Arc;

use bytes::Bytes;

use store::backend::memory::MemoryStore;
use store::backend::netkv::{NetKvServer, NetKvStore};
use store::testing;
use store::{Error, KvStore};

/// Boots a netkv server over a fresh memory store on an ephemeral port.
async fn start_server() -> String {
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
    let server = NetKvServer::new(store);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding an ephemeral port");
    let addr = listener.local_addr().expect("bound listener has an address");
    tokio::spawn(async move {
        // The task ends with the test runtime; serve errors only on
        // listener failure.
        let _ = server.serve(listener).await;
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn conformance_basic() {
    let base_url = start_server().await;
    testing::run_basic(&NetKvStore::new(base_url)).await;
}

#[tokio::test]
async fn conformance_batch_get() {
    let base_url = start_server().await;
    testing::run_batch_get(&NetKvStore::new(base_url)).await;
}

#[tokio::test]
async fn conformance_key_only() {
    let base_url = start_server().await;
    testing::run_key_only(&NetKvStore::new(base_url)).await;
}

#[tokio::test]
async fn conformance_empty_value() {
    let base_url = start_server().await;
    // The proxied memory backend stores empty values natively.
    testing::run_empty_value(&NetKvStore::new(base_url), false).await;
}

#[tokio::test]
async fn conformance_cancellation() {
    let base_url = start_server().await;
    testing::run_cancellation(&NetKvStore::new(base_url)).await;
}

#[tokio::test]
async fn should_surface_missing_single_key_as_not_found() {
    // given
    let base_url = start_server().await;
    let client = NetKvStore::new(base_url);

    // when: the single-key path resolves server-side before any stream
    let result = client.get(Bytes::from("absent")).await;

    // then
    assert_eq!(result, Err(Error::NotFound));
}

#[tokio::test]
async fn should_reject_empty_batch_get() {
    // given
    let base_url = start_server().await;
    let client = NetKvStore::new(base_url);

    // when
    let result = client.batch_get(vec![]).collect().await;

    // then
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[tokio::test]
async fn should_open_through_registry_dsn() {
    // given
    let base_url = start_server().await;
    let authority = base_url.trim_start_matches("http://");

    // when: insecure=true selects plain http
    let client = store::open(&format!("netkv://{}?insecure=true", authority))
        .await
        .unwrap();
    client
        .put(Bytes::from("k"), Bytes::from("v"))
        .await
        .unwrap();
    client.flush_puts().await.unwrap();

    // then
    assert_eq!(
        client.get(Bytes::from("k")).await.unwrap(),
        Bytes::from("v")
    );
    client.close().await.unwrap();
}

#[tokio::test]
async fn should_report_unreachable_server_as_storage_error() {
    // given: a port nothing listens on
    let client = NetKvStore::new("http://127.0.0.1:1");

    // when
    let result = client.get(Bytes::from("k")).await;

    // then
    assert!(matches!(result, Err(Error::Storage(_))));
}
