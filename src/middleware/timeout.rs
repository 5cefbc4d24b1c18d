//! Client-requested backend timeouts.
//!
//! Clients may ask for a shorter backend timeout than the configured one:
//!
//! ```text
//! X-Request-Timeout: 5000  # milliseconds
//! ```
//!
//! The value is clamped to `[MIN_REQUEST_TIMEOUT_MS, configured upstream
//! timeout]`, so it can only shorten the wait. Unparseable or zero values
//! are ignored.

use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// Floor for client-requested timeouts (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Header name for client-specified request timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Effective timeout for this request, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeout {
    pub duration: Duration,
    /// Value the client sent, for logging.
    pub requested_ms: u64,
}

impl RequestTimeout {
    /// Clamp a client request against the configured `ceiling`.
    ///
    /// Returns `None` for 0.
    pub fn from_millis(ms: u64, ceiling: Duration) -> Option<Self> {
        if ms == 0 {
            return None;
        }
        let floor = Duration::from_millis(MIN_REQUEST_TIMEOUT_MS).min(ceiling);
        let duration = Duration::from_millis(ms).clamp(floor, ceiling);
        Some(Self {
            duration,
            requested_ms: ms,
        })
    }
}

/// Middleware that reads `X-Request-Timeout`. State is the configured
/// upstream timeout.
pub async fn extract_request_timeout(
    State(ceiling): State<Duration>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(value) = request.headers().get(REQUEST_TIMEOUT_HEADER)
        && let Ok(value_str) = value.to_str()
    {
        match value_str.trim().parse::<u64>().ok().and_then(|ms| RequestTimeout::from_millis(ms, ceiling)) {
            Some(timeout) => {
                debug!(
                    requested_ms = timeout.requested_ms,
                    effective_ms = timeout.duration.as_millis() as u64,
                    "Client requested backend timeout"
                );
                request.extensions_mut().insert(timeout);
            }
            None => {
                debug!(value = value_str, "Invalid X-Request-Timeout header value, ignoring");
            }
        }
    }

    next.run(request).await
}

/// Extension trait for reading the effective timeout of a request.
pub trait RequestTimeoutExt {
    /// The client-requested timeout, or `default`.
    fn effective_timeout(&self, default: Duration) -> Duration;
}

impl<B> RequestTimeoutExt for axum::http::Request<B> {
    fn effective_timeout(&self, default: Duration) -> Duration {
        self.extensions()
            .get::<RequestTimeout>()
            .map(|t| t.duration)
            .unwrap_or(default)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    const CEILING: Duration = Duration::from_secs(30);

    #[test]
    fn test_within_bounds() {
        let timeout = RequestTimeout::from_millis(5000, CEILING).unwrap();
        assert_eq!(timeout.duration, Duration::from_millis(5000));
        assert_eq!(timeout.requested_ms, 5000);
    }

    #[test]
    fn test_clamped_to_floor() {
        let timeout = RequestTimeout::from_millis(10, CEILING).unwrap();
        assert_eq!(timeout.duration, Duration::from_millis(MIN_REQUEST_TIMEOUT_MS));
    }

    #[test]
    fn test_cannot_extend_past_ceiling() {
        let timeout = RequestTimeout::from_millis(600_000, CEILING).unwrap();
        assert_eq!(timeout.duration, CEILING);
    }

    #[test]
    fn test_zero_is_ignored() {
        assert!(RequestTimeout::from_millis(0, CEILING).is_none());
    }

    #[test]
    fn test_tiny_ceiling_wins_over_floor() {
        let ceiling = Duration::from_millis(50);
        let timeout = RequestTimeout::from_millis(10, ceiling).unwrap();
        assert_eq!(timeout.duration, ceiling);
    }

    #[test]
    fn test_effective_timeout_default() {
        let req = axum::http::Request::builder().body(Body::empty()).unwrap();
        assert_eq!(req.effective_timeout(CEILING), CEILING);
    }
}
