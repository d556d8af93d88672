use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(
    name = "pagecache",
    version,
    about = "Full-page HTTP cache with CSRF token injection"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy and the admin listener.
    Serve(Box<ServeArgs>),
    /// Remove cached pages whose URL matches a `*` pattern (postgres backend).
    Purge(PurgeArgs),
    /// Persist a new cache namespace id, invalidating every cached page.
    #[command(name = "rotate-cache-id")]
    RotateCacheId(DatabaseOverride),
    /// Print the cache namespace id this configuration resolves to.
    #[command(name = "cache-id")]
    CacheId(DatabaseOverride),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// URL pattern, e.g. `http://shop.test/products/*`.
    #[arg(value_name = "PATTERN")]
    pub pattern: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Compose the page cache into the pipeline.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the cache backend (memory|postgres).
    #[arg(long = "cache-backend", value_name = "BACKEND")]
    pub cache_backend: Option<String>,

    /// Compose the CSRF placeholder stage into the pipeline.
    #[arg(
        long = "csrf-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub csrf_enabled: Option<bool>,

    /// Override the origin the proxy forwards to.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,
}
