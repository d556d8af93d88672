//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, num::NonZeroU32, str::FromStr, time::Duration};

use axum::http::HeaderName;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::CacheBackend;
use crate::csrf::{DEFAULT_MARKER, TokenReuse};

pub use cli::{CliArgs, Command, DatabaseOverride, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const ENV_PREFIX: &str = "PAGECACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 8080;
const DEFAULT_ADMIN_PORT: u16 = 8081;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 1024;
const DEFAULT_CACHE_MAX_TTL_SECS: u64 = 86_400;
const DEFAULT_CACHE_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_IDENTITY_RESOLVE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_CSRF_SESSION_COOKIE: &str = "session";
const DEFAULT_CSRF_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_CSRF_CONTENT_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];
const DEFAULT_CSRF_HEADERS: [&str; 1] = ["x-csrf-token"];
const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 30_000;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub identity: IdentitySettings,
    pub csrf: CsrfSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub backend: CacheBackend,
    pub max_entries: usize,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub max_body_bytes: usize,
    pub allow_reload: bool,
    pub trace_header: bool,
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub resolve_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CsrfSettings {
    pub enabled: bool,
    pub marker: String,
    pub token_reuse: TokenReuse,
    pub content_types: Vec<String>,
    pub headers: Vec<HeaderName>,
    pub session_cookie: String,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_database_override(&args.database),
        Some(Command::RotateCacheId(database)) | Some(Command::CacheId(database)) => {
            raw.apply_database_override(database)
        }
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    identity: RawIdentitySettings,
    csrf: RawCsrfSettings,
    upstream: RawUpstreamSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(enabled) = overrides.csrf_enabled {
            self.csrf.enabled = Some(enabled);
        }
        if let Some(url) = overrides.upstream_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            cache,
            identity,
            csrf,
            upstream,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache, &database)?;
        let identity = build_identity_settings(identity)?;
        let csrf = build_csrf_settings(csrf)?;
        let upstream = build_upstream_settings(upstream)?;

        Ok(Self {
            server,
            logging,
            database,
            cache,
            identity,
            csrf,
            upstream,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;
    if public_addr == admin_addr {
        return Err(LoadError::invalid(
            "server.admin_port",
            "admin listener must not share the public address",
        ));
    }

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    let acquire_timeout_ms = database
        .acquire_timeout_ms
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_MS);
    if acquire_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout: Duration::from_millis(acquire_timeout_ms),
    })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    database: &DatabaseSettings,
) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend.as_deref().map(str::trim) {
        None | Some("memory") => CacheBackend::Memory,
        Some("postgres") => CacheBackend::Postgres,
        Some(other) => {
            return Err(LoadError::invalid(
                "cache.backend",
                format!("unknown backend `{other}`, expected `memory` or `postgres`"),
            ));
        }
    };
    if backend == CacheBackend::Postgres && database.url.is_none() {
        return Err(LoadError::invalid(
            "cache.backend",
            "the postgres backend requires `database.url`",
        ));
    }

    let max_entries = cache.max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES);
    if max_entries == 0 {
        return Err(LoadError::invalid(
            "cache.max_entries",
            "must be greater than zero",
        ));
    }

    let default_ttl = Duration::from_secs(cache.default_ttl_seconds.unwrap_or(0));
    let max_ttl = Duration::from_secs(
        cache
            .max_ttl_seconds
            .unwrap_or(DEFAULT_CACHE_MAX_TTL_SECS),
    );
    if default_ttl > max_ttl {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must not exceed `cache.max_ttl_seconds`",
        ));
    }

    let max_body_bytes = cache.max_body_bytes.unwrap_or(DEFAULT_CACHE_MAX_BODY_BYTES);
    if max_body_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.max_body_bytes",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        backend,
        max_entries,
        default_ttl,
        max_ttl,
        max_body_bytes,
        allow_reload: cache.allow_reload.unwrap_or(false),
        trace_header: cache.trace_header.unwrap_or(false),
    })
}

fn build_identity_settings(identity: RawIdentitySettings) -> Result<IdentitySettings, LoadError> {
    let timeout_ms = identity
        .resolve_timeout_ms
        .unwrap_or(DEFAULT_IDENTITY_RESOLVE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "identity.resolve_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(IdentitySettings {
        resolve_timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_csrf_settings(csrf: RawCsrfSettings) -> Result<CsrfSettings, LoadError> {
    let marker = csrf.marker.unwrap_or_else(|| DEFAULT_MARKER.to_string());
    if marker.is_empty() {
        return Err(LoadError::invalid("csrf.marker", "must not be empty"));
    }
    // Tokens are lowercase hex; a marker of hex digits only could reappear inside one.
    if marker
        .bytes()
        .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
    {
        return Err(LoadError::invalid(
            "csrf.marker",
            "must contain a character other than lowercase hex digits",
        ));
    }

    let token_reuse = match csrf.token_reuse.as_deref().map(str::trim) {
        None | Some("shared") => TokenReuse::Shared,
        Some("per_occurrence") => TokenReuse::PerOccurrence,
        Some(other) => {
            return Err(LoadError::invalid(
                "csrf.token_reuse",
                format!("unknown policy `{other}`, expected `shared` or `per_occurrence`"),
            ));
        }
    };

    let content_types = csrf
        .content_types
        .unwrap_or_else(|| DEFAULT_CSRF_CONTENT_TYPES.map(str::to_string).to_vec())
        .into_iter()
        .map(|media_type| media_type.trim().to_ascii_lowercase())
        .filter(|media_type| !media_type.is_empty())
        .collect();

    let headers = csrf
        .headers
        .unwrap_or_else(|| DEFAULT_CSRF_HEADERS.map(str::to_string).to_vec())
        .iter()
        .map(|name| {
            HeaderName::from_bytes(name.trim().as_bytes()).map_err(|err| {
                LoadError::invalid("csrf.headers", format!("invalid header `{name}`: {err}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let session_cookie = csrf
        .session_cookie
        .unwrap_or_else(|| DEFAULT_CSRF_SESSION_COOKIE.to_string());

    let max_body_bytes = csrf.max_body_bytes.unwrap_or(DEFAULT_CSRF_MAX_BODY_BYTES);
    if max_body_bytes == 0 {
        return Err(LoadError::invalid(
            "csrf.max_body_bytes",
            "must be greater than zero",
        ));
    }

    Ok(CsrfSettings {
        enabled: csrf.enabled.unwrap_or(true),
        marker,
        token_reuse,
        content_types,
        headers,
        session_cookie,
        max_body_bytes,
    })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = match upstream.base_url.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => {
            let url = Url::parse(value).map_err(|err| {
                LoadError::invalid("upstream.base_url", format!("failed to parse: {err}"))
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "upstream.base_url",
                    "scheme must be http or https",
                ));
            }
            Some(url)
        }
    };

    let timeout_ms = upstream.timeout_ms.unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "upstream.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_millis(timeout_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    backend: Option<String>,
    max_entries: Option<usize>,
    default_ttl_seconds: Option<u64>,
    max_ttl_seconds: Option<u64>,
    max_body_bytes: Option<usize>,
    allow_reload: Option<bool>,
    trace_header: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdentitySettings {
    resolve_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCsrfSettings {
    enabled: Option<bool>,
    marker: Option<String>,
    token_reuse: Option<String>,
    content_types: Option<Vec<String>>,
    headers: Option<Vec<String>>,
    session_cookie: Option<String>,
    max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    use clap::Parser;

    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
