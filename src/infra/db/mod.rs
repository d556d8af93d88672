//! Postgres-backed configuration store and page store.

mod app_config;
mod cache_entries;
mod util;

pub use cache_entries::PostgresCacheStore;
pub use util::map_sqlx_error;

use std::{sync::Arc, time::Duration};

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    query,
};

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}
