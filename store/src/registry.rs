//! Backend registry and DSN dispatch.
//!
//! Backend names are URL scheme prefixes. The registry is read-mostly:
//! built-in backends register at first access, external backends may
//! register at process init, and lookups never mutate. Duplicate
//! registration is a programmer error and fails fast.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, RwLock};

use crate::backend::memory::MemoryStore;
use crate::backend::netkv::NetKvStore;
use crate::backend::slate::SlateStore;
use crate::dsn::Dsn;
use crate::error::{Error, Result};
use crate::options::StoreOptions;
use crate::KvStore;

pub type FactoryFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn KvStore>>> + Send>>;

/// A store factory bound to a DSN scheme.
pub struct Registration {
    /// Unique scheme, e.g. `tikv`.
    pub name: &'static str,
    /// Human-readable name for diagnostics.
    pub title: &'static str,
    pub factory: fn(Dsn, StoreOptions) -> FactoryFuture,
}

static REGISTRY: LazyLock<RwLock<HashMap<&'static str, Registration>>> = LazyLock::new(|| {
    let registry = RwLock::new(HashMap::new());
    {
        let mut map = registry.write().expect("fresh lock cannot be poisoned");
        for reg in builtin_registrations() {
            map.insert(reg.name, reg);
        }
    }
    registry
});

fn builtin_registrations() -> Vec<Registration> {
    let mut registrations = Vec::new();
    registrations.push(Registration {
        name: "memory",
        title: "In-memory",
        factory: memory_factory,
    });
    registrations.push(Registration {
        name: "slate",
        title: "SlateDB",
        factory: slate_factory,
    });
    registrations.push(Registration {
        name: "netkv",
        title: "netkv",
        factory: netkv_factory,
    });

    #[cfg(feature = "tikv")]
    registrations.push(Registration {
        name: "tikv",
        title: "TiKV",
        factory: tikv_factory,
    });

    #[cfg(feature = "bigtable")]
    registrations.push(Registration {
        name: "bigkv",
        title: "Bigtable",
        factory: bigkv_factory,
    });

    registrations
}

fn memory_factory(dsn: Dsn, options: StoreOptions) -> FactoryFuture {
    Box::pin(async move {
        let store = MemoryStore::open(&dsn, options)?;
        Ok(Arc::new(store) as Arc<dyn KvStore>)
    })
}

fn slate_factory(dsn: Dsn, options: StoreOptions) -> FactoryFuture {
    Box::pin(async move {
        let store = SlateStore::open(&dsn, options).await?;
        Ok(Arc::new(store) as Arc<dyn KvStore>)
    })
}

fn netkv_factory(dsn: Dsn, options: StoreOptions) -> FactoryFuture {
    Box::pin(async move {
        let store = NetKvStore::open(&dsn, options)?;
        Ok(Arc::new(store) as Arc<dyn KvStore>)
    })
}

#[cfg(feature = "tikv")]
fn tikv_factory(dsn: Dsn, options: StoreOptions) -> FactoryFuture {
    use crate::backend::tikv::client::TikvRawClient;
    use crate::backend::tikv::{TikvConfig, TikvStore};

    Box::pin(async move {
        let config = TikvConfig::from_dsn(&dsn, options)?;
        let endpoints = TikvConfig::endpoints(&dsn)?;
        let client = TikvRawClient::connect(endpoints).await?;
        Ok(Arc::new(TikvStore::new(Arc::new(client), config)) as Arc<dyn KvStore>)
    })
}

#[cfg(feature = "bigtable")]
fn bigkv_factory(dsn: Dsn, options: StoreOptions) -> FactoryFuture {
    use crate::backend::bigkv::table::BigtableTable;
    use crate::backend::bigkv::{BigKvConfig, BigKvStore};

    Box::pin(async move {
        let config = BigKvConfig::from_dsn(&dsn, options)?;
        if config.create_table {
            tracing::warn!(
                table = %config.table,
                "createTable requested but table administration is provisioned out of band"
            );
        }
        let table = BigtableTable::connect(
            &config.project,
            &config.instance,
            &config.table,
            &config.family,
            &config.qualifier,
        )
        .await?;
        Ok(Arc::new(BigKvStore::new(Arc::new(table), &config)) as Arc<dyn KvStore>)
    })
}

/// Registers an external backend.
///
/// # Panics
///
/// Panics on a blank name or a name that is already registered; both are
/// programmer errors caught at init.
pub fn register(registration: Registration) {
    assert!(
        !registration.name.is_empty(),
        "store registration name cannot be blank"
    );
    let mut map = REGISTRY.write().expect("registry lock poisoned");
    if map.contains_key(registration.name) {
        let name = registration.name;
        drop(map);
        panic!("store {:?} is already registered", name);
    }
    map.insert(registration.name, registration);
}

/// True when a backend is registered under `name`.
pub fn is_registered(name: &str) -> bool {
    REGISTRY
        .read()
        .map(|map| map.contains_key(name))
        .unwrap_or(false)
}

/// Opens a store from its DSN with default options.
pub async fn open(dsn: &str) -> Result<Arc<dyn KvStore>> {
    open_with_options(dsn, StoreOptions::default()).await
}

/// Opens a store from its DSN, dispatching on the scheme before the first
/// `:`.
pub async fn open_with_options(dsn: &str, options: StoreOptions) -> Result<Arc<dyn KvStore>> {
    let scheme = dsn.split(':').next().unwrap_or_default();
    let factory = {
        let map = REGISTRY
            .read()
            .map_err(|e| Error::Internal(format!("registry lock poisoned: {}", e)))?;
        let registration = map.get(scheme).ok_or_else(|| {
            Error::InvalidInput(format!("no such kv store registered {:?}", scheme))
        })?;
        registration.factory
    };

    let parsed = Dsn::parse(dsn)?;
    factory(parsed, options).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory(_dsn: Dsn, _options: StoreOptions) -> FactoryFuture {
        Box::pin(async {
            Err(Error::Internal(
                "test factory is not meant to be called".to_string(),
            ))
        })
    }

    #[test]
    fn should_have_builtin_backends() {
        assert!(is_registered("memory"));
        assert!(is_registered("slate"));
        assert!(is_registered("netkv"));
    }

    #[test]
    fn should_register_external_backend() {
        register(Registration {
            name: "custom-engine",
            title: "Custom",
            factory: noop_factory,
        });
        assert!(is_registered("custom-engine"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn should_panic_on_duplicate_registration() {
        register(Registration {
            name: "duplicated-engine",
            title: "first",
            factory: noop_factory,
        });
        register(Registration {
            name: "duplicated-engine",
            title: "second",
            factory: noop_factory,
        });
    }

    #[tokio::test]
    async fn should_reject_unknown_scheme() {
        let result = open("nosuchstore://somewhere").await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn should_open_memory_store_from_dsn() {
        let store = open("memory://local").await.unwrap();
        assert!(store.capabilities().supports_delete);
    }
}
