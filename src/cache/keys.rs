//! Cache key derivation.
//!
//! A cached URL is addressed by a [`ResourceKey`] (namespace, method, normalized URL),
//! the unit matched by purge patterns. A resource can hold several representations
//! when the origin answers with `Vary`; each one is addressed by a [`CacheKey`] whose
//! variant digest covers the values of exactly the varied request headers.

use std::fmt;

use axum::http::{HeaderMap, Method, Request, Uri, header};
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use super::identity::NamespaceId;

const DEFAULT_HOST: &str = "localhost";

/// Cache-relevant view of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    method: Method,
    url: String,
    headers: HeaderMap,
}

impl RequestSnapshot {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap) -> Self {
        let url = normalize_url(uri, &headers);
        Self {
            method,
            url,
            headers,
        }
    }

    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::new(
            request.method().clone(),
            request.uri(),
            request.headers().clone(),
        )
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn normalized_url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// All values of a request header joined with `", "`, or `None` when absent.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let values: Vec<&str> = self
            .headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }

    /// `HEAD` is answered from the `GET` representation.
    fn key_method(&self) -> &str {
        if self.method == Method::HEAD {
            Method::GET.as_str()
        } else {
            self.method.as_str()
        }
    }
}

/// Identifies every representation of one URL inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    namespace: String,
    method: String,
    url: String,
}

impl ResourceKey {
    pub fn new(namespace: &NamespaceId, request: &RequestSnapshot) -> Self {
        Self {
            namespace: namespace.as_str().to_string(),
            method: request.key_method().to_string(),
            url: request.normalized_url().to_string(),
        }
    }

    pub(crate) fn from_parts(namespace: String, method: String, url: String) -> Self {
        Self {
            namespace,
            method,
            url,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether a purge pattern issued under `namespace` covers this resource.
    pub fn matches(&self, namespace: &NamespaceId, pattern: &str) -> bool {
        self.namespace == namespace.as_str() && glob_matches(pattern, &self.url)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.method, self.url)
    }
}

/// Addresses a single stored representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    resource: ResourceKey,
    variant: String,
}

impl CacheKey {
    /// Derive the key for `request` given the response's vary set.
    pub fn derive(namespace: &NamespaceId, request: &RequestSnapshot, vary: &[String]) -> Self {
        let resource = ResourceKey::new(namespace, request);
        let variant = variant_digest(&resource, request, vary);
        Self { resource, variant }
    }

    pub(crate) fn from_parts(resource: ResourceKey, variant: String) -> Self {
        Self { resource, variant }
    }

    pub fn resource(&self) -> &ResourceKey {
        &self.resource
    }

    /// SHA-256 hex digest over the resource key and the varied header values.
    pub fn variant(&self) -> &str {
        &self.variant
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource, self.variant)
    }
}

/// Canonical vary set: lowercased, sorted, deduplicated header names.
pub fn normalize_vary(names: impl IntoIterator<Item = impl AsRef<str>>) -> Vec<String> {
    let mut names: Vec<String> = names
        .into_iter()
        .map(|name| name.as_ref().trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Header names listed by every `Vary` header of a response.
pub fn vary_from_headers(headers: &HeaderMap) -> Vec<String> {
    normalize_vary(
        headers
            .get_all(header::VARY)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(',')),
    )
}

fn variant_digest(resource: &ResourceKey, request: &RequestSnapshot, vary: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource.to_string().as_bytes());

    for name in normalize_vary(vary) {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        match request.header_value(&name) {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update(value.as_bytes());
            }
            None => hasher.update([2u8]),
        }
    }

    hex::encode(hasher.finalize().as_slice())
}

/// Scheme, lowercased host, verbatim path and sorted query string.
pub fn normalize_url(uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
        .unwrap_or(DEFAULT_HOST)
        .to_ascii_lowercase();
    let path = match uri.path() {
        "" => "/",
        path => path,
    };

    match uri.query().map(normalize_query).filter(|query| !query.is_empty()) {
        Some(query) => format!("{scheme}://{host}{path}?{query}"),
        None => format!("{scheme}://{host}{path}"),
    }
}

fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort();
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Match `text` against a pattern where `*` stands for any run of characters.
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&byte| byte == b'*')
}
