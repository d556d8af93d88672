//! Post-cache token injection.
//!
//! Runs outside the page cache, so every response leaving the process is
//! rewritten, whether it was served from the cache or fetched from the origin.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::counter;
use tracing::{debug, warn};

use super::{
    config::CsrfConfig,
    placeholder::Substitution,
    tokens::{RandomTokenGenerator, TokenContext, TokenGenerator},
};
use crate::{
    application::error::HttpError,
    cache::{BufferedBody, buffer_body},
};

const SOURCE: &str = "csrf::middleware";

#[derive(Clone)]
pub struct CsrfPlaceholderHandler {
    config: Arc<CsrfConfig>,
    generator: Arc<dyn TokenGenerator>,
}

impl CsrfPlaceholderHandler {
    pub fn new(config: CsrfConfig, generator: Arc<dyn TokenGenerator>) -> Self {
        Self {
            config: Arc::new(config),
            generator,
        }
    }

    pub fn with_random_tokens(config: CsrfConfig) -> Self {
        Self::new(config, Arc::new(RandomTokenGenerator))
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Replace every placeholder in the scanned headers and, when the body is
    /// eligible, in the body. Responses without placeholders come back unchanged.
    pub async fn rewrite(&self, response: Response, context: &TokenContext) -> Response {
        let mut substitution = Substitution::new(&self.config.marker, self.config.token_reuse);
        let mut mint = |intent: Option<&str>| self.generator.mint(context, intent);

        let (mut parts, body) = response.into_parts();
        self.rewrite_headers(&mut parts.headers, &mut substitution, &mut mint);

        let response = if let Some(reason) = self.body_skip_reason(&parts.headers) {
            debug!(stage = "csrf", outcome = "skip_body", reason, "body not scanned");
            Response::from_parts(parts, body)
        } else {
            match buffer_body(body, self.config.max_body_bytes).await {
                Ok(BufferedBody::Complete(bytes)) => match substitution.apply(&bytes, &mut mint) {
                    Some(rewritten) => {
                        parts
                            .headers
                            .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                        Response::from_parts(parts, Body::from(rewritten))
                    }
                    None => Response::from_parts(parts, Body::from(bytes)),
                },
                Ok(BufferedBody::Overflow(body)) => {
                    debug!(
                        stage = "csrf",
                        outcome = "skip_body",
                        reason = "body_too_large",
                        "body not scanned"
                    );
                    Response::from_parts(parts, body)
                }
                Err(error) => {
                    warn!(
                        stage = "csrf",
                        outcome = "buffer_failed",
                        error = %error,
                        "failed to buffer response body"
                    );
                    return HttpError::from_error(
                        SOURCE,
                        StatusCode::BAD_GATEWAY,
                        "Response body failed",
                        &error,
                    )
                    .into_response();
                }
            }
        };

        let minted = substitution.minted();
        if minted > 0 {
            debug!(stage = "csrf", outcome = "injected", tokens = minted, "replaced placeholders");
            counter!("pagecache_csrf_tokens_total").increment(minted as u64);
        }
        response
    }

    fn rewrite_headers<F>(
        &self,
        headers: &mut HeaderMap,
        substitution: &mut Substitution<'_>,
        mint: &mut F,
    )
    where
        F: FnMut(Option<&str>) -> String,
    {
        for name in &self.config.headers {
            let values: Vec<HeaderValue> = headers.get_all(name).iter().cloned().collect();
            if values.is_empty() {
                continue;
            }

            let mut changed = false;
            let rewritten: Vec<HeaderValue> = values
                .into_iter()
                .map(|value| match substitution.apply(value.as_bytes(), &mut *mint) {
                    Some(bytes) => match HeaderValue::from_bytes(&bytes) {
                        Ok(replaced) => {
                            changed = true;
                            replaced
                        }
                        Err(_) => value,
                    },
                    None => value,
                })
                .collect();

            if changed {
                headers.remove(name);
                for value in rewritten {
                    headers.append(name.clone(), value);
                }
            }
        }
    }

    fn body_skip_reason(&self, headers: &HeaderMap) -> Option<&'static str> {
        let scanned_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| self.config.scans_content_type(value));
        if !scanned_type {
            return Some("content_type");
        }

        let encoded = headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| !value.trim().eq_ignore_ascii_case("identity"));
        if encoded {
            return Some("content_encoding");
        }

        let declared_len = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > self.config.max_body_bytes) {
            return Some("body_too_large");
        }
        None
    }
}

pub async fn csrf_placeholder_layer(
    State(handler): State<CsrfPlaceholderHandler>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let context = TokenContext::from_request(&request, &handler.config.session_cookie);
    let response = next.run(request).await;
    handler.rewrite(response, &context).await
}
