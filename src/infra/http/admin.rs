use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    application::error::{AppError, HttpError},
    cache::{CacheIdentityProvider, CacheStore},
    infra::db::PostgresRepositories,
};

use super::{
    db_health_response,
    middleware::{log_responses, set_request_context},
};

#[derive(Clone)]
pub struct AdminState {
    /// `None` when caching is disabled.
    pub store: Option<Arc<dyn CacheStore>>,
    pub identity: CacheIdentityProvider,
    pub db: Option<PostgresRepositories>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/cache/purge", post(purge_cache))
        .route("/cache/rotate-id", post(rotate_cache_id))
        .route("/health", get(health))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Deserialize)]
struct PurgeRequest {
    pattern: String,
}

#[derive(Debug, Serialize)]
struct PurgeResponse {
    purged: u64,
}

#[derive(Debug, Serialize)]
struct RotateResponse {
    cache_id: String,
}

async fn purge_cache(
    State(state): State<AdminState>,
    Json(payload): Json<PurgeRequest>,
) -> Response {
    let pattern = payload.pattern.trim();
    if pattern.is_empty() {
        return HttpError::new(
            "infra::http::admin::purge_cache",
            StatusCode::BAD_REQUEST,
            "Invalid purge pattern",
            "pattern must not be empty",
        )
        .into_response();
    }

    let Some(store) = state.store.as_ref() else {
        return HttpError::new(
            "infra::http::admin::purge_cache",
            StatusCode::CONFLICT,
            "Caching is disabled",
            "purge requested while the cache layer is not composed",
        )
        .into_response();
    };

    match store.purge(pattern).await {
        Ok(purged) => {
            info!(target = "pagecache::admin", pattern, purged, "purged cache entries");
            Json(PurgeResponse { purged }).into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

async fn rotate_cache_id(State(state): State<AdminState>) -> Response {
    match state.identity.rotate().await {
        Ok(id) => Json(RotateResponse {
            cache_id: id.to_string(),
        })
        .into_response(),
        Err(err) => AppError::from(err).into_response(),
    }
}

async fn health(State(state): State<AdminState>) -> Response {
    match state.db.as_ref() {
        Some(db) => db_health_response(db.health_check().await),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{
        CacheConfig, CachedResponse, MemoryCacheStore, NamespaceId, RequestSnapshot,
    };

    fn state(store: Option<Arc<dyn CacheStore>>) -> AdminState {
        AdminState {
            store,
            identity: CacheIdentityProvider::detached(),
            db: None,
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn purge_request(pattern: &str) -> Request<Body> {
        Request::post("/cache/purge")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "pattern": pattern }).to_string(),
            ))
            .expect("request")
    }

    #[tokio::test]
    async fn purge_reports_removed_entries() {
        let config = CacheConfig {
            default_ttl: std::time::Duration::from_secs(60),
            ..CacheConfig::default()
        };
        let store = Arc::new(MemoryCacheStore::new(NamespaceId::new("admin"), &config));
        for path in ["/a", "/b"] {
            let request = Request::get(format!("http://shop.test{path}"))
                .body(())
                .expect("request");
            let snapshot = RequestSnapshot::from_request(&request);
            let response = CachedResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/html".to_string())],
                body: bytes::Bytes::from_static(b"page"),
            };
            store.store(&snapshot, &response).await.expect("store");
        }

        let router = build_admin_router(state(Some(store.clone())));
        let response = router.oneshot(purge_request("*")).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({ "purged": 2 }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn purge_without_cache_is_a_conflict() {
        let router = build_admin_router(state(None));
        let response = router.oneshot(purge_request("*")).await.expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn empty_pattern_is_rejected() {
        let router = build_admin_router(state(None));
        let response = router.oneshot(purge_request("  ")).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rotation_requires_a_config_store() {
        let router = build_admin_router(state(None));
        let response = router
            .oneshot(
                Request::post("/cache/rotate-id")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn health_without_database_is_no_content() {
        let router = build_admin_router(state(None));
        let response = router
            .oneshot(Request::get("/health").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().contains_key("x-request-id"));
    }
}
