//! Page cache configuration.
//!
//! Built from the `[cache]` section of the settings once at startup.

use std::{num::NonZeroUsize, time::Duration};

const DEFAULT_MAX_ENTRIES: usize = 1024;
const DEFAULT_MAX_TTL_SECONDS: u64 = 86_400;
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Which store keeps cached pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Postgres,
}

impl CacheBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheBackend::Memory => "memory",
            CacheBackend::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Compose the caching layer into the pipeline.
    pub enabled: bool,
    pub backend: CacheBackend,
    /// Maximum cached resources held by the memory backend.
    pub max_entries: usize,
    /// Lifetime for responses without explicit freshness.
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    /// Larger bodies are served but never stored.
    pub max_body_bytes: usize,
    /// Honour `Cache-Control: no-cache` / `Pragma: no-cache` from clients.
    pub allow_reload: bool,
    /// Emit an `x-pagecache` header describing the path taken.
    pub trace_header: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CacheBackend::Memory,
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl: Duration::ZERO,
            max_ttl: Duration::from_secs(DEFAULT_MAX_TTL_SECONDS),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allow_reload: false,
            trace_header: false,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            backend: settings.backend,
            max_entries: settings.max_entries,
            default_ttl: settings.default_ttl,
            max_ttl: settings.max_ttl,
            max_body_bytes: settings.max_body_bytes,
            allow_reload: settings.allow_reload,
            trace_header: settings.trace_header,
        }
    }
}

impl CacheConfig {
    /// Returns the memory backend capacity, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
