//! HTTP forwarder used as the origin handler by the binary.

use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tracing::debug;
use url::Url;

use crate::{application::error::HttpError, infra::error::InfraError};

/// Requests with larger bodies are rejected before reaching the upstream.
const MAX_FORWARD_BODY_BYTES: usize = 32 * 1024 * 1024;

const SOURCE: &str = "infra::http::upstream";

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: Url,
}

impl UpstreamClient {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// A router forwarding every request to the upstream.
    pub fn into_router(self) -> Router {
        Router::new().fallback(forward).with_state(self)
    }

    fn target_url(&self, uri: &Uri) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}{}", uri.path()));
        url.set_query(uri.query());
        url
    }
}

async fn forward(State(upstream): State<UpstreamClient>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_FORWARD_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return HttpError::from_error(
                SOURCE,
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &err,
            )
            .into_response();
        }
    };

    let url = upstream.target_url(&parts.uri);
    debug!(
        target = "pagecache::upstream",
        method = %parts.method,
        url = %url,
        "forwarding request"
    );

    let mut headers = forwardable_headers(&parts.headers);
    // The upstream must answer with an identity body so placeholders stay scannable.
    headers.remove(header::ACCEPT_ENCODING);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
    }

    let result = upstream
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await;

    let response = match result {
        Ok(response) => response,
        Err(err) => return upstream_error(&err).into_response(),
    };

    let status = response.status();
    let headers = forwardable_headers(response.headers());
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(err) => return upstream_error(&err).into_response(),
    };

    let mut proxied = Response::new(Body::from(body.clone()));
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;
    proxied
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    proxied
}

fn upstream_error(err: &reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::from_error(
            SOURCE,
            StatusCode::GATEWAY_TIMEOUT,
            "Upstream timed out",
            err,
        )
    } else {
        HttpError::from_error(SOURCE, StatusCode::BAD_GATEWAY, "Upstream unavailable", err)
    }
}

/// Copy end-to-end headers only.
fn forwardable_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(source.len());
    for (name, value) in source {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> UpstreamClient {
        UpstreamClient::new(Url::parse(base).expect("url"), Duration::from_secs(1))
            .expect("client")
    }

    #[test]
    fn target_url_joins_base_path_and_query() {
        let upstream = client("http://origin.internal:8080/app/");
        let uri: Uri = "/products/42?page=2".parse().expect("uri");
        assert_eq!(
            upstream.target_url(&uri).as_str(),
            "http://origin.internal:8080/app/products/42?page=2"
        );

        let upstream = client("http://origin.internal");
        let uri: Uri = "/".parse().expect("uri");
        assert_eq!(upstream.target_url(&uri).as_str(), "http://origin.internal/");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let forwarded = forwardable_headers(&headers);
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert!(forwarded.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(forwarded.get(header::CACHE_CONTROL).unwrap(), "max-age=60");
        assert_eq!(forwarded.get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_bad_gateway() {
        use tower::ServiceExt;

        // Port 9 (discard) is not expected to accept HTTP connections.
        let router = client("http://127.0.0.1:9").into_router();
        let response = router
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert!(matches!(
            response.status(),
            StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT
        ));
    }
}
