//! Caller identity extraction.
//!
//! The identity is read from a designated header (default `X-User-ID`) and,
//! when the header is absent or blank, from a fallback cookie. Values are
//! trimmed; a whitespace-only value counts as missing.
//!
//! Requests to public paths skip extraction entirely and yield
//! [`Caller::Public`]. Extraction is a pure function of the request and the
//! gateway configuration.

use std::fmt;

use axum::http::{HeaderMap, HeaderName, header};
use cookie::Cookie;

use crate::error::{GatewayError, GatewayResult};
use crate::route_matcher::PathSet;

/// A verified, non-empty caller identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Returns `None` when the value is empty after trimming.
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is calling, as far as the gateway is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Public path: identity and session checks do not apply.
    Public,
    Identified(Identity),
}

impl Caller {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Caller::Public => None,
            Caller::Identified(identity) => Some(identity),
        }
    }
}

/// Reads caller identities from requests.
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    header: HeaderName,
    cookie: String,
    public_paths: PathSet,
}

impl IdentityExtractor {
    pub fn new(header: HeaderName, cookie: impl Into<String>, public_paths: PathSet) -> Self {
        Self {
            header,
            cookie: cookie.into(),
            public_paths,
        }
    }

    /// Name of the header carrying the identity (also used downstream).
    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.matches(path)
    }

    /// Extract the caller for a request to `path`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MissingIdentity` when the path is protected and
    /// neither the header nor the cookie carries a non-blank value.
    pub fn extract(&self, path: &str, headers: &HeaderMap) -> GatewayResult<Caller> {
        if self.is_public(path) {
            return Ok(Caller::Public);
        }

        self.from_header(headers)
            .or_else(|| self.from_cookie(headers))
            .map(Caller::Identified)
            .ok_or(GatewayError::MissingIdentity)
    }

    fn from_header(&self, headers: &HeaderMap) -> Option<Identity> {
        headers
            .get_all(&self.header)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(Identity::new)
    }

    fn from_cookie(&self, headers: &HeaderMap) -> Option<Identity> {
        cookie_value(headers, &self.cookie).and_then(|v| Identity::new(&v))
    }
}

/// Look up a cookie by name across all `Cookie` headers.
///
/// Malformed cookie pairs are skipped rather than failing the request.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}
