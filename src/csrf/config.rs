use axum::http::HeaderName;

use super::placeholder::TokenReuse;

pub const DEFAULT_MARKER: &str = "__CSRF__";
pub const DEFAULT_SESSION_COOKIE: &str = "session";
const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub enabled: bool,
    pub marker: String,
    pub token_reuse: TokenReuse,
    /// Media types whose bodies are scanned, lowercased and without parameters.
    pub content_types: Vec<String>,
    /// Response headers scanned regardless of content type.
    pub headers: Vec<HeaderName>,
    pub session_cookie: String,
    pub max_body_bytes: usize,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            marker: DEFAULT_MARKER.to_string(),
            token_reuse: TokenReuse::Shared,
            content_types: vec!["text/html".to_string(), "application/xhtml+xml".to_string()],
            headers: vec![HeaderName::from_static("x-csrf-token")],
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl From<&crate::config::CsrfSettings> for CsrfConfig {
    fn from(settings: &crate::config::CsrfSettings) -> Self {
        Self {
            enabled: settings.enabled,
            marker: settings.marker.clone(),
            token_reuse: settings.token_reuse,
            content_types: settings.content_types.clone(),
            headers: settings.headers.clone(),
            session_cookie: settings.session_cookie.clone(),
            max_body_bytes: settings.max_body_bytes,
        }
    }
}

impl CsrfConfig {
    /// Whether a `Content-Type` value selects a scanned media type.
    pub fn scans_content_type(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.content_types.iter().any(|scanned| *scanned == media_type)
    }
}
