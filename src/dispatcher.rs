//! Gateway dispatcher: the single entry point for inbound requests.
//!
//! # Layout
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← X-Request-Id assigned, forwarded, echoed
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 above MAX_REQUEST_BODY_SIZE
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │
//! └────────┬─────────┘
//!          │
//!          ├── /_gateway/health, /_gateway/ready → handlers
//!          │
//!          └── everything else → filter pipeline (see `middleware`)
//! ```
//!
//! The pipeline order is fixed here, in one `ServiceBuilder`, where the
//! first layer listed is the outermost stage. CORS sits inside the body
//! limit: it needs a `Default` response body, which the limit's wrapped
//! body does not provide.

use axum::Router;
use axum::handler::Handler;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{
    IdentityLayer, RateLimitLayer, RequestIdLayer, enforce_session, enter_pipeline,
    extract_request_timeout, inject_gateway_headers, resolve_route,
};
use crate::state::AppState;

pub const HEALTH_PATH: &str = "/_gateway/health";
pub const READY_PATH: &str = "/_gateway/ready";

/// Build the gateway router.
///
/// # Example
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// let app = build_router(state.clone());
/// axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
/// ```
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    info!(
        routes = state.routes.len(),
        public_paths = config.public_paths.len(),
        rate_limit = config.rate_limit,
        window_secs = config.rate_limit_window.as_secs(),
        session_timeout_minutes = config.session_timeout_minutes,
        session_auto_establish = config.session_auto_establish,
        trusted_proxies = config.trusted_proxies.len(),
        "Building gateway pipeline"
    );
    for route in state.routes.iter() {
        info!(
            pattern = %route.pattern,
            service = %route.rule.target_service,
            strip = route.rule.strip_prefix_count,
            "Route"
        );
    }

    let pipeline = ServiceBuilder::new()
        .layer(from_fn_with_state(state.clone(), enter_pipeline))
        .layer(IdentityLayer::new(state.identity.clone()))
        .layer(RateLimitLayer::new(state.limiter.clone()))
        .layer(from_fn_with_state(state.clone(), enforce_session))
        .layer(from_fn_with_state(state.clone(), resolve_route))
        .layer(from_fn_with_state(state.clone(), inject_gateway_headers))
        .layer(from_fn_with_state(
            config.upstream_timeout,
            extract_request_timeout,
        ))
        .service(handlers::forward.with_state(state.clone()));

    let plumbing = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(RequestIdLayer::new())
        .layer(RequestBodyLimitLayer::new(config.max_request_body_size))
        .layer(build_cors_layer(&config.cors_allowed_origins));

    Router::new()
        .route(HEALTH_PATH, get(handlers::health_check))
        .route(READY_PATH, get(handlers::readiness_check))
        .fallback_service(pipeline)
        .layer(plumbing)
        .with_state(state)
}

/// Build CORS layer from configuration. `*` allows any origin.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::route_matcher::RouteRule;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn config() -> GatewayConfig {
        GatewayConfig {
            routes: vec![RouteRule::new("/api/**", crate::config::REGISTRATION_SERVICE, 1)],
            // Nothing listens here; only stages before the proxy are exercised.
            services: [(
                crate::config::REGISTRATION_SERVICE.to_string(),
                "http://127.0.0.1:9".to_string(),
            )]
            .into(),
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_health_bypasses_pipeline() {
        let state = AppState::new(config()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::get(HEALTH_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(state.limiter.tracked_keys(), 0);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrouted_path_is_404_after_identity() {
        let state = AppState::new(config()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::get("/other")
                    .header("x-user-id", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::get("/other").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_body_limit_and_cors_both_apply() {
        let state = AppState::new(GatewayConfig {
            max_request_body_size: 16,
            ..config()
        })
        .unwrap();
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/orders")
                    .header("x-user-id", "alice")
                    .header("content-length", "64")
                    .body(Body::from(vec![0u8; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(state.limiter.tracked_keys(), 0);

        let response = app
            .oneshot(
                Request::options("/api/orders")
                    .header("origin", "https://app.example.com")
                    .header("access-control-request-method", "GET")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_dot_segments_rejected_before_classification() {
        let state = AppState::new(config()).unwrap();
        let app = build_router(state.clone());

        for path in [
            "/api/register/start/../../profile",
            "/api/register/start/%2e%2e/%2E%2E/profile",
            "/api/./profile",
        ] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {path}");
        }

        // Rejected ahead of the limiter: no bucket was created.
        assert_eq!(state.limiter.tracked_keys(), 0);
        state.shutdown().await;
    }

    #[test]
    fn test_build_cors_layer_variants() {
        let _any = build_cors_layer(&["*".to_string()]);
        let _specific = build_cors_layer(&["https://app.example.com".to_string()]);
    }
}
