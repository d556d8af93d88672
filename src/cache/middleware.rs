//! Page caching middleware.
//!
//! Sits between the client and the origin router. `GET`/`HEAD` requests are looked
//! up in the store; fresh entries are served directly, stale entries with
//! validators are revalidated with a conditional request, and misses are fetched
//! from the origin and offered to the store. Successful unsafe requests purge the
//! representations of their URL. Range and precondition requests bypass the cache.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::{
    body::{BufferedBody, buffer_body},
    config::CacheConfig,
    entry::{CacheEntry, CachedResponse},
    keys::RequestSnapshot,
    policy::{CacheControl, StoragePolicy},
    store::{CacheStore, StoreOutcome},
};
use crate::application::error::HttpError;

const SOURCE: &str = "cache::middleware";

/// Response header describing how the cache handled a request.
pub const TRACE_HEADER: &str = "x-pagecache";

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub policy: StoragePolicy,
    pub store: Arc<dyn CacheStore>,
}

impl CacheState {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self {
            policy: StoragePolicy::from_config(&config),
            config,
            store,
        }
    }
}

#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();

    if is_unsafe(&method) {
        return invalidate_after(&cache, request, next).await;
    }
    if method != Method::GET && method != Method::HEAD {
        let response = next.run(request).await;
        return trace(&cache, response, "pass");
    }
    if bypasses_cache(request.headers()) {
        debug!(cache = "page", outcome = "bypass", "range or precondition request");
        let response = next.run(request).await;
        return trace(&cache, response, "pass");
    }

    let snapshot = RequestSnapshot::from_request(&request);

    if cache.config.allow_reload && requests_reload(snapshot.headers()) {
        debug!(cache = "page", outcome = "reload", "client requested a reload");
        counter!("pagecache_miss_total").increment(1);
        strip_client_validators(&mut request);
        let response = next.run(request).await;
        return store_origin_response(&cache, &snapshot, response, "reload").await;
    }

    let cached = match cache.store.lookup(&snapshot).await {
        Ok(cached) => cached,
        Err(error) => {
            warn!(
                cache = "page",
                outcome = "lookup_failed",
                error = %error,
                "cache lookup failed, treating as miss"
            );
            None
        }
    };

    let now = OffsetDateTime::now_utc();
    match cached {
        Some(entry) if entry.is_fresh(now) => {
            debug!(cache = "page", outcome = "hit", "serving cached response");
            counter!("pagecache_hit_total").increment(1);
            let age = entry.age(now);
            let response = serve_stored(entry.response.clone(), &entry, &snapshot, age);
            trace(&cache, response, "fresh")
        }
        Some(entry) if method == Method::GET => {
            revalidate(&cache, &snapshot, request, next, entry).await
        }
        _ => {
            debug!(cache = "page", outcome = "miss", "cache miss, executing handler");
            counter!("pagecache_miss_total").increment(1);
            strip_client_validators(&mut request);
            let response = next.run(request).await;
            store_origin_response(&cache, &snapshot, response, "miss").await
        }
    }
}

/// Ask the origin whether a stale entry is still current.
async fn revalidate(
    cache: &CacheState,
    snapshot: &RequestSnapshot,
    mut request: Request<Body>,
    next: Next,
    entry: CacheEntry,
) -> Response {
    let headers = request.headers_mut();
    headers.remove(header::IF_NONE_MATCH);
    headers.remove(header::IF_MODIFIED_SINCE);
    if let Some(value) = entry.etag().and_then(|etag| HeaderValue::from_str(etag).ok()) {
        headers.insert(header::IF_NONE_MATCH, value);
    }
    if let Some(value) = entry
        .last_modified()
        .and_then(|date| HeaderValue::from_str(date).ok())
    {
        headers.insert(header::IF_MODIFIED_SINCE, value);
    }

    let response = next.run(request).await;
    if response.status() != StatusCode::NOT_MODIFIED {
        debug!(
            cache = "page",
            outcome = "stale_invalid",
            status = response.status().as_u16(),
            "origin replaced stale entry"
        );
        counter!("pagecache_miss_total").increment(1);
        return store_origin_response(cache, snapshot, response, "stale, invalid").await;
    }

    debug!(cache = "page", outcome = "stale_valid", "origin confirmed stale entry");
    counter!("pagecache_revalidated_total").increment(1);

    let refreshed = entry.response.merge_not_modified(response.headers());
    offer_to_store(cache, snapshot, &refreshed).await;

    let response = serve_stored(refreshed, &entry, snapshot, Duration::ZERO);
    trace(cache, response, "stale, valid")
}

/// Buffer an origin response and offer it to the store.
///
/// The origin saw no client validators, so a client `If-None-Match` naming the
/// fetched representation is answered here.
async fn store_origin_response(
    cache: &CacheState,
    snapshot: &RequestSnapshot,
    response: Response,
    path: &'static str,
) -> Response {
    if let Err(reason) =
        cache
            .policy
            .evaluate(snapshot, response.status().as_u16(), response.headers())
    {
        debug!(
            cache = "page",
            outcome = "pass",
            reason = reason.as_str(),
            "response not cacheable"
        );
        return trace_with(cache, response, path, "pass");
    }
    if content_length(response.headers()).is_some_and(|len| len > cache.policy.max_body_bytes()) {
        debug!(
            cache = "page",
            outcome = "pass",
            reason = "body_too_large",
            "response not cacheable"
        );
        return trace_with(cache, response, path, "pass");
    }

    let (parts, body) = response.into_parts();
    let bytes = match buffer_body(body, cache.policy.max_body_bytes()).await {
        Ok(BufferedBody::Complete(bytes)) => bytes,
        Ok(BufferedBody::Overflow(body)) => {
            debug!(
                cache = "page",
                outcome = "pass",
                reason = "body_too_large",
                "response not cacheable"
            );
            return trace_with(cache, Response::from_parts(parts, body), path, "pass");
        }
        Err(error) => {
            warn!(
                cache = "page",
                outcome = "buffer_failed",
                error = %error,
                "failed to buffer origin response"
            );
            return HttpError::from_error(
                SOURCE,
                StatusCode::BAD_GATEWAY,
                "Origin response failed",
                &error,
            )
            .into_response();
        }
    };

    let cached = CachedResponse::from_parts(parts.status, &parts.headers, bytes.clone());
    let stored = offer_to_store(cache, snapshot, &cached).await;

    let mut response = Response::from_parts(parts, Body::from(bytes));
    if response.status() == StatusCode::OK
        && snapshot
            .header_value(header::IF_NONE_MATCH.as_str())
            .is_some_and(|candidates| cached.satisfies_if_none_match(&candidates))
    {
        response = not_modified(response);
    }
    trace_with(cache, response, path, if stored { "store" } else { "pass" })
}

/// Store failures are logged and swallowed; the response is served regardless.
async fn offer_to_store(
    cache: &CacheState,
    snapshot: &RequestSnapshot,
    cached: &CachedResponse,
) -> bool {
    match cache.store.store(snapshot, cached).await {
        Ok(StoreOutcome::Stored(key)) => {
            debug!(cache = "page", outcome = "store", key = %key.resource(), "stored response");
            counter!("pagecache_store_total").increment(1);
            true
        }
        Ok(StoreOutcome::Skipped(_)) => false,
        Err(error) => {
            warn!(
                cache = "page",
                outcome = "store_failed",
                error = %error,
                "failed to store response"
            );
            counter!("pagecache_store_failed_total").increment(1);
            false
        }
    }
}

/// Run an unsafe request and drop the cached representations of its URL when the
/// origin accepted it.
async fn invalidate_after(cache: &CacheState, request: Request<Body>, next: Next) -> Response {
    let snapshot = RequestSnapshot::from_request(&request);
    let response = next.run(request).await;

    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        return trace(cache, response, "pass");
    }

    match cache.store.purge(snapshot.normalized_url()).await {
        Ok(removed) => {
            debug!(
                cache = "page",
                outcome = "invalidate",
                removed,
                "purged representations after unsafe request"
            );
        }
        Err(error) => {
            warn!(
                cache = "page",
                outcome = "invalidate_failed",
                error = %error,
                "failed to purge representations after unsafe request"
            );
        }
    }
    trace(cache, response, "invalidate")
}

/// Materialize a stored representation for this request.
fn serve_stored(
    stored: CachedResponse,
    entry: &CacheEntry,
    snapshot: &RequestSnapshot,
    age: Duration,
) -> Response {
    let unchanged = snapshot
        .header_value(header::IF_NONE_MATCH.as_str())
        .is_some_and(|candidates| entry.satisfies_if_none_match(&candidates));
    let head = snapshot.method() == Method::HEAD;

    let mut response = stored.into_response();
    if unchanged {
        response = not_modified(response);
    } else if head {
        *response.body_mut() = Body::empty();
    }
    response
        .headers_mut()
        .insert(header::AGE, HeaderValue::from(age.as_secs()));
    response
}

fn not_modified(mut response: Response) -> Response {
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    response.headers_mut().remove(header::CONTENT_LENGTH);
    response.headers_mut().remove(header::CONTENT_TYPE);
    *response.body_mut() = Body::empty();
    response
}

/// Partial and precondition requests go straight to the origin; their answers
/// never describe the full representation.
fn bypasses_cache(headers: &HeaderMap) -> bool {
    [
        header::RANGE,
        header::IF_RANGE,
        header::IF_MATCH,
        header::IF_UNMODIFIED_SINCE,
    ]
    .iter()
    .any(|name| headers.contains_key(name))
}

/// A `GET` reaching the origin must yield a full representation the cache can keep.
fn strip_client_validators(request: &mut Request<Body>) {
    if request.method() != Method::GET {
        return;
    }
    let headers = request.headers_mut();
    headers.remove(header::IF_NONE_MATCH);
    headers.remove(header::IF_MODIFIED_SINCE);
}

fn is_unsafe(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn requests_reload(headers: &HeaderMap) -> bool {
    CacheControl::from_headers(headers).no_cache
        || headers
            .get(header::PRAGMA)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_ascii_lowercase().contains("no-cache"))
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn trace(cache: &CacheState, mut response: Response, value: &'static str) -> Response {
    if cache.config.trace_header {
        response
            .headers_mut()
            .insert(TRACE_HEADER, HeaderValue::from_static(value));
    }
    response
}

fn trace_with(cache: &CacheState, response: Response, path: &str, action: &str) -> Response {
    if !cache.config.trace_header {
        return response;
    }
    let value = format!("{path}, {action}");
    let mut response = response;
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(TRACE_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn unsafe_methods() {
        assert!(is_unsafe(&Method::POST));
        assert!(is_unsafe(&Method::DELETE));
        assert!(!is_unsafe(&Method::GET));
        assert!(!is_unsafe(&Method::OPTIONS));
    }

    #[test]
    fn reload_detection() {
        assert!(requests_reload(&headers(&[("cache-control", "no-cache")])));
        assert!(requests_reload(&headers(&[("pragma", "No-Cache")])));
        assert!(!requests_reload(&headers(&[("cache-control", "max-age=0")])));
        assert!(!requests_reload(&HeaderMap::new()));
    }

    #[test]
    fn range_and_preconditions_bypass() {
        assert!(bypasses_cache(&headers(&[("range", "bytes=0-2")])));
        assert!(bypasses_cache(&headers(&[("if-match", "\"v1\"")])));
        assert!(!bypasses_cache(&headers(&[("if-none-match", "\"v1\"")])));
        assert!(!bypasses_cache(&HeaderMap::new()));
    }

    #[test]
    fn content_length_parsing() {
        assert_eq!(content_length(&headers(&[("content-length", "42")])), Some(42));
        assert_eq!(content_length(&headers(&[("content-length", "x")])), None);
    }
}
