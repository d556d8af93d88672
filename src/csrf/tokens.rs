use axum::http::{Request, header};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Request header carrying the id assigned by the request-context middleware.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request facts a token may be bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenContext {
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

impl TokenContext {
    pub fn from_request<B>(request: &Request<B>, session_cookie: &str) -> Self {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let session_id = request
            .headers()
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == session_cookie)
            .map(|(_, value)| value.to_string())
            .filter(|value| !value.is_empty());

        Self {
            request_id,
            session_id,
        }
    }
}

/// Mints the tokens substituted for placeholders.
///
/// Implementations must return 64 lowercase hex characters and must be safe to
/// call from many requests at once.
pub trait TokenGenerator: Send + Sync {
    fn mint(&self, context: &TokenContext, intent: Option<&str>) -> String;
}

/// Tokens derived from two v4 UUIDs of OS randomness, mixed with the session and
/// intent so equal inputs still never collide across sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokenGenerator;

impl TokenGenerator for RandomTokenGenerator {
    fn mint(&self, context: &TokenContext, intent: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Uuid::new_v4().as_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        if let Some(session) = context.session_id.as_deref() {
            hasher.update(session.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(intent) = intent {
            hasher.update(intent.as_bytes());
        }
        hex::encode(hasher.finalize().as_slice())
    }
}

/// Whether `token` has the shape every generator must produce.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == 64
        && token
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}
