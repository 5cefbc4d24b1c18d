use std::time::Duration;

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Gateway-wide error types with fixed HTTP status codes.
///
/// # Client Errors (terminal, never retried)
///
/// - `MissingIdentity`, `SessionExpired`, `SessionRequired` - 401
/// - `Unmatched` - 404
/// - `RateLimited` - 429 with a `Retry-After` hint
///
/// # Dependency Errors
///
/// - `BackendUnreachable`, `ServiceNotFound` - 502
/// - `BackendTimeout` - 504
///
/// The gateway never retries a failed backend call itself.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Caller identity is missing")]
    MissingIdentity,

    #[error("Session has expired")]
    SessionExpired,

    #[error("Session is required")]
    SessionRequired,

    #[error("Rate limit of {limit} exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, limit: u32 },

    #[error("No route matches path {0}")]
    Unmatched(String),

    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Backend timed out: {0}")]
    BackendTimeout(String),

    #[error("Service not registered: {0}")]
    ServiceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal gateway error: {0}")]
    Internal(String),
}

/// Error response body, shaped like the JSON the upstream services emit.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub timestamp: DateTime<Utc>,
    pub status: u16,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl GatewayError {
    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingIdentity
            | GatewayError::SessionExpired
            | GatewayError::SessionRequired => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Unmatched(_) => StatusCode::NOT_FOUND,
            GatewayError::BackendUnreachable(_) | GatewayError::ServiceNotFound(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable error type for the response body.
    fn kind(&self) -> &'static str {
        match self {
            GatewayError::MissingIdentity => "missing_identity",
            GatewayError::SessionExpired => "session_expired",
            GatewayError::SessionRequired => "session_required",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Unmatched(_) => "not_found",
            GatewayError::BackendUnreachable(_) => "backend_unreachable",
            GatewayError::BackendTimeout(_) => "backend_timeout",
            GatewayError::ServiceNotFound(_) => "service_not_found",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Client-facing message. Dependency and internal errors never leak
    /// backend addresses or transport details.
    fn public_message(&self) -> String {
        match self {
            GatewayError::MissingIdentity => "Authentication required".to_string(),
            GatewayError::SessionExpired => {
                "Session expired. Please sign in again.".to_string()
            }
            GatewayError::SessionRequired => {
                "A session is required. Please sign in.".to_string()
            }
            GatewayError::RateLimited { .. } => {
                "Rate limit exceeded. Please retry later.".to_string()
            }
            GatewayError::Unmatched(path) => format!("No route for {path}"),
            GatewayError::BackendUnreachable(_) | GatewayError::ServiceNotFound(_) => {
                "Upstream service is unavailable.".to_string()
            }
            GatewayError::BackendTimeout(_) => "Upstream service timed out.".to_string(),
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                "An internal error occurred.".to_string()
            }
        }
    }

    /// Whole seconds a rejected caller should wait, rounded up, never zero.
    pub fn retry_after_secs(retry_after: Duration) -> u64 {
        let secs = retry_after.as_secs();
        let rounded = if retry_after.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs
        };
        rounded.max(1)
    }

    /// Build the response, annotating the body with the request path and id.
    pub fn into_response_for(self, path: Option<&str>, request_id: Option<&str>) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, path = ?path, "Request failed");
        } else {
            tracing::warn!(error = %self, path = ?path, "Request rejected");
        }

        let body = ErrorResponse {
            timestamp: Utc::now(),
            status: status.as_u16(),
            error: self.kind(),
            message: self.public_message(),
            path: path.map(str::to_string),
            request_id: request_id.map(str::to_string),
        };

        let mut response = (status, axum::Json(body)).into_response();

        if let GatewayError::RateLimited { retry_after, limit } = &self {
            let headers = response.headers_mut();
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from(Self::retry_after_secs(*retry_after)),
            );
            headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        }

        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_for(None, None)
    }
}

/// Convenience type alias for Results with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::MissingIdentity.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::SessionExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::Unmatched("/x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::BackendUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::BackendTimeout("slow".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(GatewayError::retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(GatewayError::retry_after_secs(Duration::from_millis(1500)), 2);
        assert_eq!(GatewayError::retry_after_secs(Duration::from_secs(3)), 3);
        assert_eq!(GatewayError::retry_after_secs(Duration::ZERO), 1);
        assert_eq!(GatewayError::retry_after_secs(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = GatewayError::RateLimited {
            retry_after: Duration::from_millis(2500),
            limit: 10,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "3");
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "10");
    }

    #[test]
    fn test_dependency_errors_do_not_leak_details() {
        let err = GatewayError::BackendUnreachable("connect to 10.0.0.7:9000 refused".into());
        assert!(!err.public_message().contains("10.0.0.7"));
    }
}
