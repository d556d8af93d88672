use std::{future::IntoFuture, process, sync::Arc, time::Duration};

use pagecache::{
    application::error::AppError,
    cache::{
        CacheBackend, CacheConfig, CacheIdentityProvider, CacheState, CacheStore, ConfigLookup,
        MemoryCacheStore, NamespaceId,
    },
    config,
    csrf::{CsrfConfig, CsrfPlaceholderHandler},
    infra::{
        db::{PostgresCacheStore, PostgresRepositories},
        error::InfraError,
        http::{self, AdminState, UpstreamClient},
        telemetry,
    },
};
use tokio::{sync::watch, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Purge(args) => run_purge(settings, args).await,
        config::Command::RotateCacheId(_) => run_rotate_cache_id(settings).await,
        config::Command::CacheId(_) => run_cache_id(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let base_url = settings
        .upstream
        .base_url
        .clone()
        .ok_or_else(|| InfraError::configuration("upstream.base_url is required to serve"))?;
    let origin = UpstreamClient::new(base_url, settings.upstream.timeout)?;

    let repositories = connect_database(&settings).await?;
    let identity = identity_provider(&settings, repositories.as_ref());

    // Composition is decided here, once; a disabled cache never sees a lookup.
    let cache_config = CacheConfig::from(&settings.cache);
    let store = if cache_config.enabled {
        let namespace = identity.resolve().await;
        info!(
            target = "pagecache::serve",
            backend = cache_config.backend.as_str(),
            cache_id = %namespace,
            "page cache enabled"
        );
        Some(build_store(&cache_config, namespace, repositories.as_ref())?)
    } else {
        info!(target = "pagecache::serve", "page cache disabled");
        None
    };
    let cache_state = store
        .clone()
        .map(|store| CacheState::new(cache_config.clone(), store));

    let csrf_config = CsrfConfig::from(&settings.csrf);
    let csrf = csrf_config
        .enabled
        .then(|| CsrfPlaceholderHandler::with_random_tokens(csrf_config));

    info!(
        target = "pagecache::serve",
        upstream = %origin.base_url(),
        csrf = csrf.is_some(),
        "starting listeners"
    );

    let public_router = http::build_public_router(origin.into_router(), cache_state, csrf);
    let admin_router = http::build_admin_router(AdminState {
        store,
        identity,
        db: repositories,
    });

    serve_http(&settings, public_router, admin_router).await
}

async fn run_purge(settings: config::Settings, args: config::PurgeArgs) -> Result<(), AppError> {
    if settings.cache.backend != CacheBackend::Postgres {
        return Err(AppError::validation(
            "purging from the command line requires the postgres backend; \
             use the admin listener of a running process for the memory backend",
        ));
    }

    let repositories = require_database(&settings).await?;
    let identity = identity_provider(&settings, Some(&repositories));
    let namespace = match identity.lookup().await {
        ConfigLookup::Found(value) if !value.trim().is_empty() => NamespaceId::new(value),
        ConfigLookup::Found(_) | ConfigLookup::NotFound => {
            return Err(AppError::validation(
                "no persisted cache id, there is nothing to purge",
            ));
        }
        ConfigLookup::Unavailable(reason) => {
            return Err(AppError::from(InfraError::database(reason)));
        }
    };

    let config = CacheConfig::from(&settings.cache);
    let store = PostgresCacheStore::new(repositories, namespace, &config);
    let purged = store.purge(&args.pattern).await?;

    info!(
        target = "pagecache::purge",
        pattern = %args.pattern,
        purged,
        "purge completed"
    );
    println!("{purged}");
    Ok(())
}

async fn run_rotate_cache_id(settings: config::Settings) -> Result<(), AppError> {
    let repositories = require_database(&settings).await?;
    let identity = identity_provider(&settings, Some(&repositories));
    let id = identity.rotate().await?;

    info!(
        target = "pagecache::identity",
        "running processes pick up the new cache id on restart"
    );
    println!("{id}");
    Ok(())
}

async fn run_cache_id(settings: config::Settings) -> Result<(), AppError> {
    let repositories = connect_database(&settings).await?;
    let identity = identity_provider(&settings, repositories.as_ref());
    println!("{}", identity.resolve().await);
    Ok(())
}

/// Connect when a database URL is configured. A configured database that cannot be
/// reached is fatal.
async fn connect_database(
    settings: &config::Settings,
) -> Result<Option<PostgresRepositories>, AppError> {
    let Some(database_url) = settings.database.url.as_ref() else {
        return Ok(None);
    };

    let pool = PostgresRepositories::connect(
        database_url,
        settings.database.max_connections.get(),
        settings.database.acquire_timeout,
    )
    .await
    .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(Some(PostgresRepositories::new(pool)))
}

async fn require_database(settings: &config::Settings) -> Result<PostgresRepositories, AppError> {
    connect_database(settings)
        .await?
        .ok_or_else(|| AppError::from(InfraError::configuration("database url is not configured")))
}

fn identity_provider(
    settings: &config::Settings,
    repositories: Option<&PostgresRepositories>,
) -> CacheIdentityProvider {
    match repositories {
        Some(repositories) => CacheIdentityProvider::new(
            Arc::new(repositories.clone()),
            settings.identity.resolve_timeout,
        ),
        None => CacheIdentityProvider::detached(),
    }
}

fn build_store(
    config: &CacheConfig,
    namespace: NamespaceId,
    repositories: Option<&PostgresRepositories>,
) -> Result<Arc<dyn CacheStore>, AppError> {
    match config.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCacheStore::new(namespace, config))),
        CacheBackend::Postgres => {
            let repositories = repositories.cloned().ok_or_else(|| {
                InfraError::configuration("the postgres cache backend needs database.url")
            })?;
            Ok(Arc::new(PostgresCacheStore::new(
                repositories,
                namespace,
                config,
            )))
        }
    }
}

async fn serve_http(
    settings: &config::Settings,
    public_router: axum::Router,
    admin_router: axum::Router,
) -> Result<(), AppError> {
    let public_listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let admin_listener = tokio::net::TcpListener::bind(settings.server.admin_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "pagecache::serve",
        public = %settings.server.public_addr,
        admin = %settings.server.admin_addr,
        "listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));

    let servers = async { try_join!(public_server.into_future(), admin_server.into_future()) };
    let drain_deadline = drain_deadline(shutdown_rx, settings.server.graceful_shutdown);

    tokio::select! {
        result = servers => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))?;
        }
        _ = drain_deadline => {
            warn!(
                target = "pagecache::serve",
                "graceful shutdown deadline elapsed, dropping open connections"
            );
        }
    }

    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

async fn drain_deadline(shutdown: watch::Receiver<bool>, grace: Duration) {
    wait_for_shutdown(shutdown).await;
    tokio::time::sleep(grace).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!(target = "pagecache::serve", "shutdown signal received");
}
