//! Gateway-owned health endpoints.
//!
//! # Endpoints
//!
//! - `GET /_gateway/health` - Liveness with state sizes, always 200
//! - `GET /_gateway/ready` - 200 while accepting traffic, 503 once shutdown begins
//!
//! Both are served by the gateway itself and never enter the filter
//! pipeline, so they are not rate limited or forwarded.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::{HealthResponse, ReadinessResponse};
use crate::state::AppState;

/// Liveness endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "routes": 1,
///   "rate_limit_windows": 42,
///   "active_sessions": 17,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        routes: state.routes.len(),
        rate_limit_windows: state.limiter.tracked_keys(),
        active_sessions: state.sessions.active_sessions(),
        timestamp: Utc::now(),
    })
}

/// Readiness probe.
#[instrument(skip(state))]
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let ready = state.is_accepting();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            services: state.proxy.registry().len(),
        }),
    )
}
