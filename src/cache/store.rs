//! Page store contract and the in-process backend.
//!
//! Every store is bound to one [`NamespaceId`] at construction; keys are derived
//! from that id plus the request, so two stores with different ids never observe
//! each other's entries even when they share the same backend.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

use super::{
    config::CacheConfig,
    entry::{CacheEntry, CachedResponse},
    identity::NamespaceId,
    keys::{CacheKey, RequestSnapshot, ResourceKey, vary_from_headers},
    lock::{rw_read, rw_write},
    policy::{SkipReason, StoragePolicy},
};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache backend failure: {0}")]
    Backend(String),
    #[error("cache backend timed out")]
    Timeout,
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }
}

/// Result of a store attempt. Declining to store is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored(CacheKey),
    Skipped(SkipReason),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// The representation matching `request`, if it is fresh or can be revalidated.
    async fn lookup(&self, request: &RequestSnapshot) -> Result<Option<CacheEntry>, StoreError>;

    /// Persist `response` for `request` when the storage policy allows it.
    async fn store(
        &self,
        request: &RequestSnapshot,
        response: &CachedResponse,
    ) -> Result<StoreOutcome, StoreError>;

    /// Remove every representation whose URL matches `pattern` (`*` wildcard) in
    /// this store's namespace. Returns the number of entries removed.
    async fn purge(&self, pattern: &str) -> Result<u64, StoreError>;
}

/// Build the entry a store would persist, or the reason not to.
pub(crate) fn prepare_entry(
    namespace: &NamespaceId,
    policy: &StoragePolicy,
    request: &RequestSnapshot,
    response: &CachedResponse,
) -> Result<CacheEntry, SkipReason> {
    let headers = response.header_map();
    let ttl = policy.evaluate(request, response.status, &headers)?;
    policy.check_body(response.body.len())?;

    let vary = vary_from_headers(&headers);
    Ok(CacheEntry {
        key: CacheKey::derive(namespace, request, &vary),
        response: response.clone(),
        stored_at: OffsetDateTime::now_utc(),
        ttl,
        vary,
    })
}

/// Stale entries without validators can never be served again.
pub(crate) fn is_usable(entry: &CacheEntry, now: OffsetDateTime) -> bool {
    entry.is_fresh(now) || entry.is_revalidatable()
}

/// Pick the representation of a resource that answers `request`.
///
/// A candidate matches when re-deriving its key with its own vary set and the
/// current request yields the stored key. Unusable stale entries are ignored.
pub(crate) fn select_variant(
    namespace: &NamespaceId,
    request: &RequestSnapshot,
    candidates: impl IntoIterator<Item = CacheEntry>,
    now: OffsetDateTime,
) -> Option<CacheEntry> {
    candidates
        .into_iter()
        .filter(|entry| CacheKey::derive(namespace, request, &entry.vary) == entry.key)
        .filter(|entry| is_usable(entry, now))
        .max_by_key(|entry| entry.stored_at)
}

pub(crate) fn log_skipped(request: &RequestSnapshot, reason: SkipReason) -> StoreOutcome {
    debug!(
        cache = "page",
        outcome = "skip",
        reason = reason.as_str(),
        url = request.normalized_url(),
        "response not stored"
    );
    StoreOutcome::Skipped(reason)
}

pub(crate) fn record_purge(backend: &'static str, removed: u64) {
    counter!("pagecache_purged_total", "backend" => backend).increment(removed);
}

/// LRU-bounded store kept in process memory.
///
/// Capacity is counted in resources; all representations of one URL are evicted
/// together.
pub struct MemoryCacheStore {
    namespace: NamespaceId,
    policy: StoragePolicy,
    resources: Arc<RwLock<LruCache<ResourceKey, Vec<CacheEntry>>>>,
}

impl MemoryCacheStore {
    pub fn new(namespace: NamespaceId, config: &CacheConfig) -> Self {
        Self {
            namespace,
            policy: StoragePolicy::from_config(config),
            resources: Arc::new(RwLock::new(LruCache::new(config.max_entries_non_zero()))),
        }
    }

    /// A view of the same backing memory under another namespace.
    pub fn for_namespace(&self, namespace: NamespaceId) -> Self {
        Self {
            namespace,
            policy: self.policy.clone(),
            resources: Arc::clone(&self.resources),
        }
    }

    pub fn namespace(&self) -> &NamespaceId {
        &self.namespace
    }

    /// Number of cached resources across all namespaces.
    pub fn len(&self) -> usize {
        rw_read(&self.resources, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn lookup(&self, request: &RequestSnapshot) -> Result<Option<CacheEntry>, StoreError> {
        let resource = ResourceKey::new(&self.namespace, request);
        let now = OffsetDateTime::now_utc();

        let mut resources = rw_write(&self.resources, SOURCE, "lookup");
        let Some(variants) = resources.get_mut(&resource) else {
            return Ok(None);
        };
        variants.retain(|entry| is_usable(entry, now));
        let candidates = variants.clone();
        if candidates.is_empty() {
            resources.pop(&resource);
        }
        drop(resources);

        Ok(select_variant(&self.namespace, request, candidates, now))
    }

    async fn store(
        &self,
        request: &RequestSnapshot,
        response: &CachedResponse,
    ) -> Result<StoreOutcome, StoreError> {
        let entry = match prepare_entry(&self.namespace, &self.policy, request, response) {
            Ok(entry) => entry,
            Err(reason) => return Ok(log_skipped(request, reason)),
        };
        let key = entry.key.clone();
        let resource = key.resource().clone();
        let now = entry.stored_at;

        let mut resources = rw_write(&self.resources, SOURCE, "store");
        if let Some(variants) = resources.get_mut(&resource) {
            variants.retain(|existing| existing.key != key && is_usable(existing, now));
            variants.push(entry);
        } else if let Some((evicted, _)) = resources.push(resource, vec![entry]) {
            debug!(
                cache = "page",
                outcome = "evict",
                resource = %evicted,
                "evicted least recently used page"
            );
            counter!("pagecache_evicted_total").increment(1);
        }

        Ok(StoreOutcome::Stored(key))
    }

    async fn purge(&self, pattern: &str) -> Result<u64, StoreError> {
        let mut resources = rw_write(&self.resources, SOURCE, "purge");
        let matching: Vec<ResourceKey> = resources
            .iter()
            .filter(|(resource, _)| resource.matches(&self.namespace, pattern))
            .map(|(resource, _)| resource.clone())
            .collect();

        let removed = matching
            .iter()
            .filter_map(|resource| resources.pop(resource))
            .map(|variants| variants.len() as u64)
            .sum();

        record_purge("memory", removed);
        Ok(removed)
    }
}
