mod admin;
mod middleware;
mod upstream;

pub use admin::{AdminState, build_admin_router};
pub use middleware::{RequestContext, log_responses, set_request_context};
pub use upstream::UpstreamClient;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    response::{IntoResponse, Response},
};
use sqlx::Error as SqlxError;

use crate::{
    application::error::ErrorReport,
    cache::{CacheState, response_cache_layer},
    csrf::{CsrfPlaceholderHandler, csrf_placeholder_layer},
};

fn db_health_response(result: Result<(), SqlxError>) -> Response {
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::db_health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

/// Wrap an origin router with the public pipeline.
///
/// From the outside in: request context, response logging, CSRF placeholder
/// substitution, page cache, origin. Passing `None` leaves a stage out entirely.
pub fn build_public_router(
    origin: Router,
    cache: Option<CacheState>,
    csrf: Option<CsrfPlaceholderHandler>,
) -> Router {
    let router = match cache {
        Some(cache_state) => origin.layer(axum_middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        )),
        None => origin,
    };

    let router = match csrf {
        Some(handler) => router.layer(axum_middleware::from_fn_with_state(
            handler,
            csrf_placeholder_layer,
        )),
        None => router,
    };

    router
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
