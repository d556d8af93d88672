//! Storability and freshness rules.
//!
//! Decides whether an origin response may be shared between clients and for how
//! long, from `Cache-Control`, `Expires`, `Vary` and the request that produced it.

use std::time::{Duration, SystemTime};

use axum::http::{HeaderMap, Method, header};

use super::{config::CacheConfig, keys::RequestSnapshot};

/// Statuses stored without explicit freshness information.
const CACHEABLE_BY_DEFAULT: [u16; 6] = [200, 203, 204, 300, 301, 308];

/// Partial and not-modified answers never stand in for a full representation,
/// whatever freshness the origin attaches to them.
const NEVER_STORED: [u16; 2] = [206, 304];

/// Parsed `Cache-Control` directives that affect shared caching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();
        directives.merge(value);
        directives
    }

    /// Combine every `Cache-Control` header on a message.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            if let Ok(value) = value.to_str() {
                directives.merge(value);
            }
        }
        directives
    }

    fn merge(&mut self, value: &str) {
        for directive in value.split(',') {
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name, Some(argument.trim().trim_matches('"'))),
                None => (directive, None),
            };
            match name.trim().to_ascii_lowercase().as_str() {
                "no-store" => self.no_store = true,
                "no-cache" => self.no_cache = true,
                "private" => self.private = true,
                "public" => self.public = true,
                "must-revalidate" | "proxy-revalidate" => self.must_revalidate = true,
                "max-age" => self.max_age = argument.and_then(parse_seconds).or(self.max_age),
                "s-maxage" => self.s_maxage = argument.and_then(parse_seconds).or(self.s_maxage),
                _ => {}
            }
        }
    }
}

fn parse_seconds(value: &str) -> Option<u64> {
    value.parse().ok()
}

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Method,
    NoStore,
    Private,
    VaryWildcard,
    SetCookie,
    Authorization,
    Status(u16),
    ZeroLifetime,
    BodyTooLarge,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Method => "method",
            SkipReason::NoStore => "no_store",
            SkipReason::Private => "private",
            SkipReason::VaryWildcard => "vary_wildcard",
            SkipReason::SetCookie => "set_cookie",
            SkipReason::Authorization => "authorization",
            SkipReason::Status(_) => "status",
            SkipReason::ZeroLifetime => "zero_lifetime",
            SkipReason::BodyTooLarge => "body_too_large",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoragePolicy {
    default_ttl: Duration,
    max_ttl: Duration,
    max_body_bytes: usize,
}

impl StoragePolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            default_ttl: config.default_ttl,
            max_ttl: config.max_ttl,
            max_body_bytes: config.max_body_bytes,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Freshness lifetime for a storable response, or the reason it must not be stored.
    ///
    /// A zero lifetime is only accepted when the response carries validators, so the
    /// entry is revalidated on every use.
    pub fn evaluate(
        &self,
        request: &RequestSnapshot,
        status: u16,
        headers: &HeaderMap,
    ) -> Result<Duration, SkipReason> {
        if request.method() != Method::GET {
            return Err(SkipReason::Method);
        }
        if CacheControl::from_headers(request.headers()).no_store {
            return Err(SkipReason::NoStore);
        }

        let directives = CacheControl::from_headers(headers);
        if directives.no_store {
            return Err(SkipReason::NoStore);
        }
        if directives.private {
            return Err(SkipReason::Private);
        }
        if super::keys::vary_from_headers(headers)
            .iter()
            .any(|name| name == "*")
        {
            return Err(SkipReason::VaryWildcard);
        }
        if headers.contains_key(header::SET_COOKIE) {
            return Err(SkipReason::SetCookie);
        }
        if request.headers().contains_key(header::AUTHORIZATION)
            && !(directives.public || directives.s_maxage.is_some() || directives.must_revalidate)
        {
            return Err(SkipReason::Authorization);
        }

        if NEVER_STORED.contains(&status) {
            return Err(SkipReason::Status(status));
        }
        let explicit = explicit_lifetime(&directives, headers);
        if explicit.is_none() && !CACHEABLE_BY_DEFAULT.contains(&status) {
            return Err(SkipReason::Status(status));
        }

        let lifetime = if directives.no_cache {
            Duration::ZERO
        } else {
            explicit
                .unwrap_or(self.default_ttl)
                .saturating_sub(origin_age(headers))
                .min(self.max_ttl)
        };

        if lifetime.is_zero() && !has_validators(headers) {
            return Err(SkipReason::ZeroLifetime);
        }
        Ok(lifetime)
    }

    pub fn check_body(&self, len: usize) -> Result<(), SkipReason> {
        if len > self.max_body_bytes {
            Err(SkipReason::BodyTooLarge)
        } else {
            Ok(())
        }
    }
}

/// `s-maxage`, then `max-age`, then `Expires - Date`. An unparseable `Expires`
/// means already expired.
fn explicit_lifetime(directives: &CacheControl, headers: &HeaderMap) -> Option<Duration> {
    if let Some(seconds) = directives.s_maxage.or(directives.max_age) {
        return Some(Duration::from_secs(seconds));
    }

    let expires = headers.get(header::EXPIRES)?;
    let Some(expires) = expires
        .to_str()
        .ok()
        .and_then(|value| httpdate::parse_http_date(value).ok())
    else {
        return Some(Duration::ZERO);
    };
    let date = headers
        .get(header::DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .unwrap_or_else(SystemTime::now);

    Some(expires.duration_since(date).unwrap_or(Duration::ZERO))
}

fn origin_age(headers: &HeaderMap) -> Duration {
    headers
        .get(header::AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO)
}

pub fn has_validators(headers: &HeaderMap) -> bool {
    headers.contains_key(header::ETAG) || headers.contains_key(header::LAST_MODIFIED)
}
