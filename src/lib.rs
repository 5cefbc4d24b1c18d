//! # Edge Gateway
//!
//! A single network entry point in front of a set of backend services,
//! featuring:
//!
//! - **Routing**: path patterns (`*`, `**`) mapped to named services, with
//!   leading-segment stripping and per-route headers
//! - **Identity**: caller identity from a header or cookie, propagated to
//!   backends as a verified header; client-supplied copies are overwritten
//! - **Rate Limiting**: fixed windows keyed by identity, or by client address
//!   on public paths
//! - **Sessions**: time-limited session cookies bound to the identity
//! - **Observability**: request IDs, structured logging, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Plumbing (Trace → Request ID → Body Limit → CORS)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Filter pipeline (Identity → Rate Limit → Session → Route   │
//! │                   → Header Injection → Timeout)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ProxyClient (streaming reqwest, per-request deadline)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backend services (registration-service, ...)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use edge_gateway::{AppState, GatewayConfig, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = GatewayConfig::from_env()?;
//!     let addr = config.server_addr();
//!
//!     let state = AppState::new(config)?;
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind(addr).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Point the default `/api/**` route at a backend:
//! ```bash
//! REGISTRATION_SERVICE_URL=http://localhost:8081 cargo run
//! ```
//!
//! Tighten the limiter:
//! ```bash
//! RATE_LIMIT=10 RATE_LIMIT_WINDOW_SECS=1 cargo run
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod rate_limiter;
pub mod route_matcher;
pub mod session;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use config::GatewayConfig;
pub use dispatcher::build_router;
pub use error::{GatewayError, GatewayResult};
pub use state::AppState;
