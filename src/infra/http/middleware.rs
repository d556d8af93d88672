use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, csrf::REQUEST_ID_HEADER};

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Assign a request id, exposed as an extension and as the `x-request-id` header on
/// both the request and the response.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let ctx = RequestContext {
        request_id: request_id.clone(),
    };
    let header_value = HeaderValue::from_str(&request_id).ok();

    request.extensions_mut().insert(ctx.clone());
    if let Some(value) = header_value.clone() {
        request.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let mut response = next.run(request).await;
    response.extensions_mut().insert(ctx);
    if let Some(value) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("origin", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "pagecache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "pagecache::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "client request error",
            );
        }
    }

    response
}
