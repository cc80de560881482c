//! Read options, construction options, and backend capability flags.

/// Options recognized by scan-shaped read operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// When true, iterators produce records with an empty value. Backends
    /// suppress value fetch and decode where their engine allows it.
    pub key_only: bool,
}

impl ReadOptions {
    pub fn key_only() -> Self {
        Self { key_only: true }
    }
}

/// Construction-time options applied when opening a store from a DSN.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Opt this store into empty values. Backends whose engine rejects empty
    /// values switch to the sentinel encoding; backends with native support
    /// ignore the flag.
    pub enable_empty_value: bool,
}

/// Capability flags a backend reports to callers and to the conformance
/// suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether the engine stores empty values natively, without the
    /// sentinel encoding.
    pub supports_empty_value: bool,
    /// Whether the backend implements batched deletion. Required by the
    /// purgeable overlay.
    pub supports_delete: bool,
}
