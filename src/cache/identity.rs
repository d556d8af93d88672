//! Cache namespace identity.
//!
//! Every cache key is prefixed with a [`NamespaceId`]. The id lives in the
//! configuration store under [`CACHE_ID_KEY`] so a deployment keeps a warm cache
//! across restarts, while deployments sharing the same cache backend never see each
//! other's entries. Replacing the id makes every old entry unreachable at once.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Configuration store key holding the persisted namespace id.
pub const CACHE_ID_KEY: &str = "cache-id";

const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Opaque identifier that isolates one deployment's cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespaceId(String);

impl NamespaceId {
    /// Generate a fresh random id (128 bits, 32 lowercase hex chars).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap a persisted id. Stored ids are opaque and used verbatim.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of reading a single value from the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLookup {
    Found(String),
    NotFound,
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no configuration store is attached")]
    Detached,
    #[error("configuration store write failed: {0}")]
    Write(String),
    #[error("configuration store write timed out")]
    Timeout,
}

/// Durable key-value configuration storage (one row per key).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Read a value. Connection problems are reported as [`ConfigLookup::Unavailable`].
    async fn fetch_value(&self, key: &str) -> ConfigLookup;

    /// Insert or replace a value.
    async fn store_value(&self, key: &str, value: &str) -> Result<(), IdentityError>;
}

/// Resolves the namespace id once at startup.
///
/// Resolution never fails: a missing or unreachable store yields a freshly generated
/// id that is not persisted, which keeps the cache isolated at the cost of a cold
/// start.
#[derive(Clone)]
pub struct CacheIdentityProvider {
    store: Option<Arc<dyn ConfigStore>>,
    timeout: Duration,
}

impl CacheIdentityProvider {
    pub fn new(store: Arc<dyn ConfigStore>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            timeout,
        }
    }

    /// A provider without backing storage; every resolution yields a new id.
    pub fn detached() -> Self {
        Self {
            store: None,
            timeout: DEFAULT_RESOLVE_TIMEOUT,
        }
    }

    /// Read the persisted id, bounded by the configured timeout.
    pub async fn lookup(&self) -> ConfigLookup {
        let Some(store) = self.store.as_ref() else {
            return ConfigLookup::Unavailable("no configuration store attached".to_string());
        };

        match tokio::time::timeout(self.timeout, store.fetch_value(CACHE_ID_KEY)).await {
            Ok(lookup) => lookup,
            Err(_) => ConfigLookup::Unavailable(format!(
                "read timed out after {} ms",
                self.timeout.as_millis()
            )),
        }
    }

    pub async fn resolve(&self) -> NamespaceId {
        match self.lookup().await {
            ConfigLookup::Found(value) if !value.trim().is_empty() => {
                info!(
                    target = "pagecache::identity",
                    source = "config_store",
                    "resolved persisted cache namespace"
                );
                NamespaceId::new(value)
            }
            ConfigLookup::Found(_) | ConfigLookup::NotFound => {
                let id = NamespaceId::generate();
                info!(
                    target = "pagecache::identity",
                    source = "generated",
                    cache_id = %id,
                    "no persisted cache namespace, using an ephemeral one"
                );
                id
            }
            ConfigLookup::Unavailable(reason) => {
                let id = NamespaceId::generate();
                warn!(
                    target = "pagecache::identity",
                    source = "generated",
                    reason = %reason,
                    cache_id = %id,
                    "configuration store unavailable, cache namespace isolated to this process"
                );
                id
            }
        }
    }

    /// Persist a brand new id. Running processes keep their id until restarted.
    pub async fn rotate(&self) -> Result<NamespaceId, IdentityError> {
        let store = self.store.as_ref().ok_or(IdentityError::Detached)?;
        let id = NamespaceId::generate();

        tokio::time::timeout(self.timeout, store.store_value(CACHE_ID_KEY, id.as_str()))
            .await
            .map_err(|_| IdentityError::Timeout)??;

        info!(
            target = "pagecache::identity",
            cache_id = %id,
            "rotated persisted cache namespace"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FixedStore {
        lookup: ConfigLookup,
        written: Mutex<Vec<(String, String)>>,
    }

    impl FixedStore {
        fn new(lookup: ConfigLookup) -> Arc<Self> {
            Arc::new(Self {
                lookup,
                written: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ConfigStore for FixedStore {
        async fn fetch_value(&self, key: &str) -> ConfigLookup {
            assert_eq!(key, CACHE_ID_KEY);
            self.lookup.clone()
        }

        async fn store_value(&self, key: &str, value: &str) -> Result<(), IdentityError> {
            self.written
                .lock()
                .expect("written lock")
                .push((key.to_string(), value.to_string()));
            Ok(())
        }
    }

    struct StalledStore;

    #[async_trait]
    impl ConfigStore for StalledStore {
        async fn fetch_value(&self, _key: &str) -> ConfigLookup {
            std::future::pending().await
        }

        async fn store_value(&self, _key: &str, _value: &str) -> Result<(), IdentityError> {
            std::future::pending().await
        }
    }

    fn is_generated(id: &NamespaceId) -> bool {
        id.as_str().len() == 32 && id.as_str().chars().all(|c| c.is_ascii_hexdigit())
    }

    #[tokio::test]
    async fn persisted_value_is_returned_unchanged() {
        let store = FixedStore::new(ConfigLookup::Found("abc123".to_string()));
        let provider = CacheIdentityProvider::new(store, Duration::from_secs(1));

        assert_eq!(provider.resolve().await.as_str(), "abc123");
    }

    #[tokio::test]
    async fn connection_failure_falls_back_to_generated_id() {
        let store = FixedStore::new(ConfigLookup::Unavailable("connection refused".to_string()));
        let provider = CacheIdentityProvider::new(store, Duration::from_secs(1));

        let id = provider.resolve().await;
        assert!(is_generated(&id), "unexpected id {id}");
    }

    #[tokio::test]
    async fn missing_or_blank_value_generates_id() {
        for lookup in [ConfigLookup::NotFound, ConfigLookup::Found("  ".to_string())] {
            let provider =
                CacheIdentityProvider::new(FixedStore::new(lookup), Duration::from_secs(1));
            assert!(is_generated(&provider.resolve().await));
        }
    }

    #[tokio::test]
    async fn fallback_ids_differ_between_resolutions() {
        let provider = CacheIdentityProvider::detached();
        assert_ne!(provider.resolve().await, provider.resolve().await);
    }

    #[tokio::test]
    async fn stalled_store_counts_as_unavailable() {
        let provider =
            CacheIdentityProvider::new(Arc::new(StalledStore), Duration::from_millis(20));

        assert!(matches!(
            provider.lookup().await,
            ConfigLookup::Unavailable(_)
        ));
        assert!(is_generated(&provider.resolve().await));
    }

    #[tokio::test]
    async fn rotate_persists_new_id() {
        let store = FixedStore::new(ConfigLookup::NotFound);
        let provider = CacheIdentityProvider::new(store.clone(), Duration::from_secs(1));

        let id = provider.rotate().await.expect("rotation succeeds");

        let written = store.written.lock().expect("written lock");
        assert_eq!(
            written.as_slice(),
            &[(CACHE_ID_KEY.to_string(), id.as_str().to_string())]
        );
    }

    #[tokio::test]
    async fn rotate_requires_store() {
        let error = CacheIdentityProvider::detached()
            .rotate()
            .await
            .expect_err("detached provider cannot rotate");
        assert!(matches!(error, IdentityError::Detached));
    }

    #[tokio::test]
    async fn rotate_times_out_on_stalled_store() {
        let provider =
            CacheIdentityProvider::new(Arc::new(StalledStore), Duration::from_millis(20));
        let error = provider.rotate().await.expect_err("stalled write");
        assert!(matches!(error, IdentityError::Timeout));
    }
}
