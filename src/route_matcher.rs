//! Path-based route matching with deterministic precedence.
//!
//! # Pattern Grammar
//!
//! | Pattern     | Matches                                         |
//! |-------------|-------------------------------------------------|
//! | `/a/b`      | exactly `/a/b`                                  |
//! | `/a/*`      | one segment below `/a` (`/a/x`, not `/a/x/y`)   |
//! | `/a/**`     | `/a` itself and everything below it             |
//! | `/**`       | every path                                      |
//!
//! Wildcards are only allowed as the final segment. Matching is
//! segment-aware: `/api/**` does not match `/apix`. An exact pattern may
//! not end in `/` (other than `/` itself).
//!
//! # Precedence
//!
//! Candidate rules are tried in this order:
//!
//! 1. Longest literal prefix first (`/api/v2/**` before `/api/**`)
//! 2. At equal literal length: exact, then single-segment, then subtree
//! 3. Remaining ties: declaration order, first declared wins
//!
//! Two rules with the same literal and kind are rejected at construction
//! time, so for any concrete path at most one rule wins.
//!
//! # Path Rewrite
//!
//! A matched rule strips `strip_prefix_count` leading segments before the
//! request is forwarded: `/api/v2/orders` with a count of 2 becomes `/orders`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum PatternKind {
    // Declared in ascending precedence; the derived Ord is used for sorting.
    Subtree,
    SingleSegment,
    Exact,
}

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    literal: String,
    kind: PatternKind,
}

impl PathPattern {
    /// Parse a pattern such as `/api/**`, `/users/*` or `/health`.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the pattern does not start with `/`,
    /// uses a wildcard anywhere but the last segment, or is an exact pattern
    /// with a trailing slash.
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let raw = raw.trim();
        if !raw.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Path pattern must start with '/': {raw:?}"
            )));
        }

        let (literal, kind) = if let Some(prefix) = raw.strip_suffix("/**") {
            (prefix, PatternKind::Subtree)
        } else if let Some(prefix) = raw.strip_suffix("/*") {
            (prefix, PatternKind::SingleSegment)
        } else {
            (raw, PatternKind::Exact)
        };

        if literal.contains('*') {
            return Err(GatewayError::Config(format!(
                "Wildcards are only allowed as the final segment: {raw:?}"
            )));
        }

        if kind == PatternKind::Exact && literal.len() > 1 && literal.ends_with('/') {
            return Err(GatewayError::Config(format!(
                "Exact pattern must not end with '/': {raw:?}"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            literal: literal.to_string(),
            kind,
        })
    }

    /// Check whether a concrete request path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let Some(rest) = path.strip_prefix(self.literal.as_str()) else {
            return false;
        };

        match self.kind {
            PatternKind::Exact => rest.is_empty(),
            PatternKind::Subtree => rest.is_empty() || rest.starts_with('/'),
            PatternKind::SingleSegment => rest
                .strip_prefix('/')
                .is_some_and(|segment| !segment.is_empty() && !segment.contains('/')),
        }
    }

    /// Sort key: higher sorts first.
    fn precedence(&self) -> (usize, PatternKind) {
        (self.literal.len(), self.kind)
    }

    /// Two patterns with the same key match exactly the same paths.
    fn match_key(&self) -> (&str, PatternKind) {
        (&self.literal, self.kind)
    }

    /// The pattern as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A set of patterns, used for the public (unauthenticated) paths.
#[derive(Debug, Clone, Default)]
pub struct PathSet {
    patterns: Vec<PathPattern>,
}

impl PathSet {
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> GatewayResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| PathPattern::parse(p.as_ref()))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// A routing rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Inbound pattern, see the module docs for the grammar.
    pub path_pattern: String,
    /// Logical service name, resolved through the service registry.
    pub target_service: String,
    /// Leading path segments removed before forwarding.
    #[serde(default)]
    pub strip_prefix_count: usize,
    /// Headers added to every request forwarded by this rule.
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
}

impl RouteRule {
    pub fn new(
        path_pattern: impl Into<String>,
        target_service: impl Into<String>,
        strip_prefix_count: usize,
    ) -> Self {
        Self {
            path_pattern: path_pattern.into(),
            target_service: target_service.into(),
            strip_prefix_count,
            extra_headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }
}

/// A validated rule with its pattern and headers pre-parsed.
#[derive(Debug)]
pub struct CompiledRoute {
    pub rule: RouteRule,
    pub pattern: PathPattern,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Position in the configured list.
    pub declared_at: usize,
}

impl CompiledRoute {
    fn compile(rule: RouteRule, declared_at: usize) -> GatewayResult<Self> {
        let pattern = PathPattern::parse(&rule.path_pattern)?;

        if rule.target_service.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "Route {pattern} has an empty target service"
            )));
        }

        let headers = rule
            .extra_headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    GatewayError::Config(format!("Route {pattern}: invalid header {name:?}: {e}"))
                })?;
                let value = HeaderValue::from_str(value).map_err(|e| {
                    GatewayError::Config(format!("Route {pattern}: invalid value for {name}: {e}"))
                })?;
                Ok((name, value))
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        Ok(Self {
            rule,
            pattern,
            headers,
            declared_at,
        })
    }
}

/// The outcome of a successful match, stored on the request for later stages.
#[derive(Debug, Clone)]
pub struct ResolvedRoute {
    pub route: Arc<CompiledRoute>,
    /// Path after prefix stripping (no query string).
    pub forward_path: String,
}

impl ResolvedRoute {
    pub fn target_service(&self) -> &str {
        &self.route.rule.target_service
    }
}

/// Ordered route table.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Build a table from configured rules.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` for invalid patterns or headers, and
    /// for two rules matching the same paths (ambiguous routing).
    pub fn new(rules: Vec<RouteRule>) -> GatewayResult<Self> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(rules.len());

        for (declared_at, rule) in rules.into_iter().enumerate() {
            let compiled = CompiledRoute::compile(rule, declared_at)?;
            let key = compiled.pattern.match_key();
            if !seen.insert((key.0.to_string(), key.1)) {
                return Err(GatewayError::Config(format!(
                    "Duplicate route pattern {}",
                    compiled.pattern
                )));
            }
            routes.push(Arc::new(compiled));
        }

        // Stable sort keeps declaration order among equal precedence.
        routes.sort_by(|a, b| b.pattern.precedence().cmp(&a.pattern.precedence()));

        Ok(Self { routes })
    }

    /// Find the winning rule for `path` and compute the forwarded path.
    ///
    /// `None` means the request is unrouted and must not reach any backend.
    pub fn resolve(&self, path: &str) -> Option<ResolvedRoute> {
        self.routes
            .iter()
            .find(|route| route.pattern.matches(path))
            .map(|route| ResolvedRoute {
                route: Arc::clone(route),
                forward_path: strip_path_segments(path, route.rule.strip_prefix_count),
            })
    }

    /// Routes in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &CompiledRoute> {
        self.routes.iter().map(|r| r.as_ref())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// `true` if any segment of `path` is `.` or `..`, literally or
/// percent-encoded.
///
/// Such paths are rejected before classification: the outbound URL would
/// collapse them, so the path that was matched is not the path forwarded.
/// A backslash counts as a separator because URL parsers treat it as one.
pub fn has_dot_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

/// Remove `count` leading segments from `path`.
///
/// Empty segments are dropped, a trailing slash is preserved, and stripping
/// every segment yields `/`.
pub fn strip_path_segments(path: &str, count: usize) -> String {
    let trailing_slash = path.len() > 1 && path.ends_with('/');

    let mut out = String::with_capacity(path.len());
    for segment in path.split('/').filter(|s| !s.is_empty()).skip(count) {
        out.push('/');
        out.push_str(segment);
    }

    if out.is_empty() {
        out.push('/');
    } else if trailing_slash {
        out.push('/');
    }
    out
}
