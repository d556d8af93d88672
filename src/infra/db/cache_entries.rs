use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::types::Json;
use time::OffsetDateTime;
use tracing::warn;

use crate::cache::{
    CacheConfig, CacheEntry, CacheKey, CacheStore, CachedResponse, NamespaceId, RequestSnapshot,
    ResourceKey, StoragePolicy, StoreError, StoreOutcome, is_usable, log_skipped, prepare_entry,
    record_purge, select_variant,
};

use super::{PostgresRepositories, map_sqlx_error};

/// Page store shared by every process pointing at the same database.
pub struct PostgresCacheStore {
    repositories: PostgresRepositories,
    namespace: NamespaceId,
    policy: StoragePolicy,
}

impl PostgresCacheStore {
    pub fn new(
        repositories: PostgresRepositories,
        namespace: NamespaceId,
        config: &CacheConfig,
    ) -> Self {
        Self {
            repositories,
            namespace,
            policy: StoragePolicy::from_config(config),
        }
    }
}

impl PostgresCacheStore {
    /// Drop rows that can never be served again. Failures only delay the cleanup.
    async fn delete_variants(&self, entries: &[CacheEntry]) {
        let keys: Vec<String> = entries
            .iter()
            .map(|entry| entry.key.variant().to_string())
            .collect();
        let result = sqlx::query(
            r#"
            DELETE FROM http_cache_entries
            WHERE namespace = $1 AND variant_key = ANY($2)
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(&keys)
        .execute(self.repositories.pool())
        .await;

        if let Err(error) = result {
            warn!(
                cache = "page",
                outcome = "prune_failed",
                error = %error,
                "failed to delete expired cache rows"
            );
        }
    }
}

#[derive(sqlx::FromRow)]
struct CacheEntryRow {
    variant_key: String,
    namespace: String,
    method: String,
    url: String,
    vary: Json<Vec<String>>,
    status: i16,
    headers: Json<Vec<(String, String)>>,
    body: Vec<u8>,
    stored_at: OffsetDateTime,
    ttl_seconds: i64,
}

impl TryFrom<CacheEntryRow> for CacheEntry {
    type Error = StoreError;

    fn try_from(row: CacheEntryRow) -> Result<Self, Self::Error> {
        let status = u16::try_from(row.status)
            .map_err(|_| StoreError::backend(format!("invalid stored status {}", row.status)))?;
        let ttl = u64::try_from(row.ttl_seconds).unwrap_or(0);

        Ok(CacheEntry {
            key: CacheKey::from_parts(
                ResourceKey::from_parts(row.namespace, row.method, row.url),
                row.variant_key,
            ),
            response: CachedResponse {
                status,
                headers: row.headers.0,
                body: Bytes::from(row.body),
            },
            stored_at: row.stored_at,
            ttl: Duration::from_secs(ttl),
            vary: row.vary.0,
        })
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    async fn lookup(&self, request: &RequestSnapshot) -> Result<Option<CacheEntry>, StoreError> {
        let resource = ResourceKey::new(&self.namespace, request);
        let rows = sqlx::query_as::<_, CacheEntryRow>(
            r#"
            SELECT variant_key,
                   namespace,
                   method,
                   url,
                   vary,
                   status,
                   headers,
                   body,
                   stored_at,
                   ttl_seconds
            FROM http_cache_entries
            WHERE namespace = $1 AND method = $2 AND url = $3
            "#,
        )
        .bind(resource.namespace())
        .bind(resource.method())
        .bind(resource.url())
        .fetch_all(self.repositories.pool())
        .await
        .map_err(map_sqlx_error)?;

        let now = OffsetDateTime::now_utc();
        let (candidates, unusable): (Vec<CacheEntry>, Vec<CacheEntry>) = rows
            .into_iter()
            .map(CacheEntry::try_from)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .partition(|entry| is_usable(entry, now));

        if !unusable.is_empty() {
            self.delete_variants(&unusable).await;
        }

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
        let resource = entry.key.resource();
        let ttl_seconds = i64::try_from(entry.ttl.as_secs()).unwrap_or(i64::MAX);
        let status = i16::try_from(entry.response.status)
            .map_err(|_| StoreError::backend("status does not fit the status column"))?;

        sqlx::query(
            r#"
            INSERT INTO http_cache_entries (
                variant_key,
                namespace,
                method,
                url,
                vary,
                status,
                headers,
                body,
                stored_at,
                ttl_seconds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (variant_key) DO UPDATE SET
                vary = EXCLUDED.vary,
                status = EXCLUDED.status,
                headers = EXCLUDED.headers,
                body = EXCLUDED.body,
                stored_at = EXCLUDED.stored_at,
                ttl_seconds = EXCLUDED.ttl_seconds
            "#,
        )
        .bind(entry.key.variant())
        .bind(resource.namespace())
        .bind(resource.method())
        .bind(resource.url())
        .bind(Json(&entry.vary))
        .bind(status)
        .bind(Json(&entry.response.headers))
        .bind(entry.response.body.as_ref())
        .bind(entry.stored_at)
        .bind(ttl_seconds)
        .execute(self.repositories.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(StoreOutcome::Stored(entry.key))
    }

    async fn purge(&self, pattern: &str) -> Result<u64, StoreError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM http_cache_entries
            WHERE namespace = $1 AND url LIKE $2 ESCAPE '\'
            "#,
        )
        .bind(self.namespace.as_str())
        .bind(glob_to_like(pattern))
        .execute(self.repositories.pool())
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

        record_purge("postgres", removed);
        Ok(removed)
    }
}

/// Translate a `*` pattern into a `LIKE` pattern escaped with `\`.
fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len() + 8);
    for ch in pattern.chars() {
        match ch {
            '*' => like.push('%'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(ch);
            }
            other => like.push(other),
        }
    }
    like
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translation_escapes_like_wildcards() {
        assert_eq!(glob_to_like("*"), "%");
        assert_eq!(
            glob_to_like("http://shop.test/products/*"),
            "http://shop.test/products/%"
        );
        assert_eq!(glob_to_like("/a_b%c\\d"), "/a\\_b\\%c\\\\d");
    }

    #[test]
    fn rows_convert_into_entries() {
        let row = CacheEntryRow {
            variant_key: "abc".to_string(),
            namespace: "n1".to_string(),
            method: "GET".to_string(),
            url: "http://shop.test/".to_string(),
            vary: Json(vec!["accept-language".to_string()]),
            status: 200,
            headers: Json(vec![("etag".to_string(), "\"v1\"".to_string())]),
            body: b"<p>hi</p>".to_vec(),
            stored_at: OffsetDateTime::now_utc(),
            ttl_seconds: 60,
        };

        let entry = CacheEntry::try_from(row).expect("valid row");
        assert_eq!(entry.key.resource().to_string(), "n1:GET:http://shop.test/");
        assert_eq!(entry.key.variant(), "abc");
        assert_eq!(entry.ttl, Duration::from_secs(60));
        assert_eq!(entry.etag(), Some("\"v1\""));
        assert_eq!(entry.vary, vec!["accept-language".to_string()]);
    }

    #[test]
    fn negative_status_is_rejected() {
        let row = CacheEntryRow {
            variant_key: "abc".to_string(),
            namespace: "n1".to_string(),
            method: "GET".to_string(),
            url: "http://shop.test/".to_string(),
            vary: Json(Vec::new()),
            status: -1,
            headers: Json(Vec::new()),
            body: Vec::new(),
            stored_at: OffsetDateTime::now_utc(),
            ttl_seconds: -5,
        };
        assert!(CacheEntry::try_from(row).is_err());
    }
}
