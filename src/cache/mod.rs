//! Full-page response cache.
//!
//! - [`identity`]: the namespace id every key is prefixed with.
//! - [`keys`]: request normalization and key derivation.
//! - [`policy`]: storability and freshness rules.
//! - [`store`]: the store contract and the in-memory backend. The Postgres backend
//!   lives in `infra::db`.
//! - [`body`]: bounded body buffering.
//! - [`middleware`]: the axum layer that serves, revalidates and stores pages.
//!
//! ```toml
//! [cache]
//! enabled = true
//! backend = "memory"
//! max_entries = 1024
//! default_ttl_seconds = 0
//! ```

pub mod body;
mod config;
mod entry;
pub mod identity;
pub mod keys;
mod lock;
mod middleware;
pub mod policy;
mod store;

pub use body::{BufferedBody, buffer_body};
pub use config::{CacheBackend, CacheConfig};
pub use entry::{CacheEntry, CachedResponse};
pub use identity::{CacheIdentityProvider, ConfigLookup, ConfigStore, IdentityError, NamespaceId};
pub use keys::{CacheKey, RequestSnapshot, ResourceKey, glob_matches};
pub use middleware::{CacheState, TRACE_HEADER, response_cache_layer};
pub use policy::{CacheControl, SkipReason, StoragePolicy};
pub use store::{CacheStore, MemoryCacheStore, StoreError, StoreOutcome};

pub(crate) use store::{is_usable, log_skipped, prepare_entry, record_purge, select_variant};
