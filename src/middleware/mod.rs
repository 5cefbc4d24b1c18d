//! Filter pipeline stages and request plumbing.
//!
//! # Filter Pipeline
//!
//! Each stage wraps the next (onion model). A stage that rejects returns
//! immediately; the stages it is nested in still see the response on the
//! way out, the stages after it never run.
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌───────────────────┐
//! │  enter_pipeline   │ ← public/protected classification, context, DONE log + metrics
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │  IdentityLayer    │ ← 401 MissingIdentity
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │  RateLimitLayer   │ ← 429 + Retry-After
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │  enforce_session  │ ← 401 SessionExpired / SessionRequired; Set-Cookie on the way out
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │  resolve_route    │ ← 404 Unmatched; path rewrite
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │ inject_gateway_   │ ← marker + verified identity + route headers
//! │ headers           │
//! └─────────┬─────────┘
//!           ▼
//! ┌───────────────────┐
//! │ extract_request_  │ ← client-requested (shorter) timeout
//! │ timeout           │
//! └─────────┬─────────┘
//!           ▼
//!     handlers::forward  ← 502 / 504 on backend failure
//! ```
//!
//! # Plumbing (whole router)
//!
//! - [`RequestIdLayer`]: `X-Request-Id` assignment and echo
//! - [`ip`]: client address with trusted proxy validation

pub mod context;
pub mod headers;
pub mod identity;
pub mod ip;
pub mod rate_limit;
pub mod request_id;
pub mod routing;
pub mod session;
pub mod timeout;

pub use context::{
    DispatchState, Outcome, RequestContext, RequestContextExt, enter_pipeline, missing_context,
};
pub use headers::inject_gateway_headers;
pub use identity::IdentityLayer;
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_IP, client_address};
pub use rate_limit::RateLimitLayer;
pub use request_id::{REQUEST_ID_HEADER, RequestIdExt, RequestIdLayer};
pub use routing::resolve_route;
pub use session::enforce_session;
pub use timeout::{
    MIN_REQUEST_TIMEOUT_MS, REQUEST_TIMEOUT_HEADER, RequestTimeout, RequestTimeoutExt,
    extract_request_timeout,
};
