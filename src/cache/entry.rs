//! Stored representations.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use time::OffsetDateTime;

use super::keys::CacheKey;

/// Headers taken from the stored response even when a 304 lists them.
fn kept_on_revalidation(name: &HeaderName) -> bool {
    [
        header::CONTENT_LENGTH,
        header::CONTENT_ENCODING,
        header::CONTENT_RANGE,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
    ]
    .contains(name)
}

/// A buffered response as it is kept in a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Capture a response. Header values that are not visible ASCII are dropped.
    pub fn from_parts(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers: headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), s.to_string())))
                .collect(),
            body,
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Weak comparison of `If-None-Match` candidates against this response's `ETag`.
    pub fn satisfies_if_none_match(&self, if_none_match: &str) -> bool {
        let Some(etag) = self.header(header::ETAG.as_str()) else {
            return false;
        };
        let etag = etag.trim_start_matches("W/");
        if_none_match.split(',').map(str::trim).any(|candidate| {
            candidate == "*" || candidate.trim_start_matches("W/") == etag
        })
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Apply the headers of a `304 Not Modified` to this representation.
    pub fn merge_not_modified(&self, not_modified: &HeaderMap) -> Self {
        let mut headers = self.header_map();
        for name in not_modified.keys() {
            if kept_on_revalidation(name) {
                continue;
            }
            headers.remove(name);
            for value in not_modified.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        Self::from_parts(
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            &headers,
            self.body.clone(),
        )
    }

    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);

        for (name, value) in self.headers {
            if let Ok(header_value) = HeaderValue::from_str(&value) {
                builder = builder.header(name, header_value);
            }
        }

        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// One representation of a resource plus the metadata needed to judge freshness.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: CachedResponse,
    pub stored_at: OffsetDateTime,
    pub ttl: Duration,
    /// Normalized names of the request headers this representation varies on.
    pub vary: Vec<String>,
}

impl CacheEntry {
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.stored_at).unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.age(now) < self.ttl
    }

    pub fn etag(&self) -> Option<&str> {
        self.response.header(header::ETAG.as_str())
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.response.header(header::LAST_MODIFIED.as_str())
    }

    pub fn is_revalidatable(&self) -> bool {
        self.etag().is_some() || self.last_modified().is_some()
    }

    /// Whether a client's `If-None-Match` already names this representation.
    pub fn satisfies_if_none_match(&self, if_none_match: &str) -> bool {
        self.response.satisfies_if_none_match(if_none_match)
    }
}
