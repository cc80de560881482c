//! A uniform key-value storage abstraction over heterogeneous backends.
//!
//! Higher-level indexing and sinking services write and read ordered
//! byte-keyed records through one contract — point get, batched get,
//! batched delete, range and prefix scans, buffered put with explicit
//! flush — while each backend (embedded log-structured, distributed raw KV
//! cluster, managed wide-column, networked proxy) retains its native
//! strengths.
//!
//! # Key concepts
//!
//! - [`KvStore`]: the driver contract every backend honors identically.
//! - [`KvIterator`]: a streaming, cancellable view over scan results.
//! - [`Batch`]: the size/count/time triple-threshold write accumulator.
//! - [`Pipeline`](pipeline::Pipeline): per-store key prefixing, value
//!   compression, and empty-value encoding, inverted symmetrically on read.
//! - [`PurgeableStore`]: height-tagged deletion markers with TTL purge.
//! - [`registry`]: DSN-scheme dispatch to registered backend factories.
//!
//! # Example
//!
//! ```ignore
//! use bytes::Bytes;
//! use store::{Limit, ReadOptions};
//!
//! let kv = store::open("slate:///var/data/blocks").await?;
//!
//! kv.put(Bytes::from("ba"), Bytes::from("2")).await?;
//! kv.flush_puts().await?;
//!
//! let mut it = kv.prefix(Bytes::from("b"), Limit(10), ReadOptions::default());
//! while it.next().await {
//!     println!("{:?} = {:?}", it.item().key, it.item().value);
//! }
//! if let Some(err) = it.err() {
//!     return Err(err.clone().into());
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod compression;
pub mod driver;
pub mod dsn;
pub mod error;
pub mod iterator;
pub mod model;
pub mod options;
pub mod pipeline;
pub mod purgeable;
pub mod registry;
pub mod testing;

pub use batch::Batch;
pub use compression::Compressor;
pub use driver::KvStore;
pub use dsn::Dsn;
pub use error::{Error, Result};
pub use iterator::{IteratorSender, KvIterator};
pub use model::{Key, Kv, Limit};
pub use options::{Capabilities, ReadOptions, StoreOptions};
pub use purgeable::PurgeableStore;
pub use registry::{open, open_with_options, register, Registration};
