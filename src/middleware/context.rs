//! Per-request dispatch context and the pipeline entry stage.
//!
//! Every request entering the filter pipeline gets a [`RequestContext`] in
//! its extensions. Stages read and extend it (caller, route) and advance its
//! [`DispatchState`]:
//!
//! ```text
//! START → IDENTITY_CHECKED → RATE_CHECKED → SESSION_CHECKED → ROUTED → FORWARDED → DONE
//!   │            │                 │               │             │          │
//!   └────────────┴─────────────────┴───────────────┴─────────────┴──────────┴──→ DONE (early exit)
//! ```
//!
//! A stage that short-circuits calls [`RequestContext::reject`], which maps
//! the error to its fixed status and tags the response with an [`Outcome`]
//! so the entry stage can log and count it on the way out.

use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, trace, warn};

use super::ip::client_address;
use super::request_id::RequestIdExt;
use crate::error::GatewayError;
use crate::identity::Caller;
use crate::metrics;
use crate::route_matcher::{ResolvedRoute, has_dot_segment};
use crate::state::AppState;

/// Position of a request in the dispatch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DispatchState {
    Start,
    IdentityChecked,
    RateChecked,
    SessionChecked,
    Routed,
    Forwarded,
    Done,
}

/// Final label of a request, stored in response extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome(pub &'static str);

impl Outcome {
    pub const FORWARDED: Outcome = Outcome("forwarded");

    pub fn of(error: &GatewayError) -> Self {
        Outcome(match error {
            GatewayError::MissingIdentity
            | GatewayError::SessionExpired
            | GatewayError::SessionRequired => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Unmatched(_) => "unmatched",
            GatewayError::BackendUnreachable(_) | GatewayError::ServiceNotFound(_) => {
                "bad_gateway"
            }
            GatewayError::BackendTimeout(_) => "gateway_timeout",
            GatewayError::Config(_) | GatewayError::Internal(_) => "internal",
        })
    }
}

/// State threaded through the filter pipeline for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Inbound path, before any rewrite.
    pub path: String,
    /// Rate-limit key source for public paths.
    pub client_addr: String,
    pub public: bool,
    /// Set by the identity stage.
    pub caller: Option<Caller>,
    /// Set by the routing stage.
    pub route: Option<ResolvedRoute>,
    state: DispatchState,
}

impl RequestContext {
    pub fn new(request_id: String, path: String, client_addr: String, public: bool) -> Self {
        Self {
            request_id,
            path,
            client_addr,
            public,
            caller: None,
            route: None,
            state: DispatchState::Start,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Move forward in the state machine. Transitions never go backwards.
    pub fn advance(&mut self, next: DispatchState) {
        if next <= self.state {
            warn!(
                request_id = %self.request_id,
                from = ?self.state,
                to = ?next,
                "Ignoring backwards dispatch transition"
            );
            return;
        }
        trace!(request_id = %self.request_id, from = ?self.state, to = ?next, "Dispatch transition");
        self.state = next;
    }

    /// Early exit: finish the request with `error`'s status.
    pub fn reject(&mut self, error: GatewayError) -> Response {
        debug!(request_id = %self.request_id, at = ?self.state, error = %error, "Short-circuiting request");
        self.state = DispatchState::Done;

        let outcome = Outcome::of(&error);
        let mut response = error.into_response_for(Some(&self.path), Some(&self.request_id));
        response.extensions_mut().insert(outcome);
        response
    }
}

/// Response for a stage that runs without a context, which means the
/// pipeline was wired without its entry stage.
pub fn missing_context() -> Response {
    let mut response =
        GatewayError::Internal("Request context missing from pipeline".to_string()).into_response();
    response
        .extensions_mut()
        .insert(Outcome::of(&GatewayError::Internal(String::new())));
    response
}

/// Pipeline entry: classify the path as public or protected, create the
/// context, and account for the request once the inner stages return.
///
/// Paths with `.` or `..` segments end here with 404: they would be
/// classified and routed as written but forwarded collapsed.
pub async fn enter_pipeline(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let started = Instant::now();
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let request_id = req.request_id().unwrap_or_else(|| "unknown".to_string());
    let client_addr = client_address(&req, &state.trusted_proxies).into_owned();
    let public = state.identity.is_public(&path);

    debug!(
        request_id = %request_id,
        method = %method,
        path = %path,
        client = %client_addr,
        public,
        state = ?DispatchState::Start,
        "Request entered pipeline"
    );

    let mut ctx = RequestContext::new(request_id.clone(), path.clone(), client_addr, public);
    let response = if has_dot_segment(&path) {
        warn!(request_id = %request_id, path = %path, "Rejecting path with dot segments");
        ctx.reject(GatewayError::Unmatched(path.clone()))
    } else {
        req.extensions_mut().insert(ctx);
        next.run(req).await
    };

    let status = response.status();
    let outcome = response
        .extensions()
        .get::<Outcome>()
        .copied()
        .unwrap_or(Outcome("other"));
    let elapsed = started.elapsed();
    metrics::record_request(outcome.0, status.as_u16(), elapsed.as_secs_f64());

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = status.as_u16(),
        outcome = outcome.0,
        elapsed_ms = elapsed.as_millis() as u64,
        state = ?DispatchState::Done,
        "Request finished"
    );

    response
}

/// Access to the dispatch context stored on a request.
pub trait RequestContextExt {
    fn dispatch_context(&self) -> Option<&RequestContext>;
    fn dispatch_context_mut(&mut self) -> Option<&mut RequestContext>;
}

impl<B> RequestContextExt for axum::http::Request<B> {
    fn dispatch_context(&self) -> Option<&RequestContext> {
        self.extensions().get::<RequestContext>()
    }

    fn dispatch_context_mut(&mut self) -> Option<&mut RequestContext> {
        self.extensions_mut().get_mut::<RequestContext>()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "req-1".to_string(),
            "/api/orders".to_string(),
            "127.0.0.1".to_string(),
            false,
        )
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut ctx = ctx();
        assert_eq!(ctx.state(), DispatchState::Start);

        ctx.advance(DispatchState::IdentityChecked);
        ctx.advance(DispatchState::RateChecked);
        assert_eq!(ctx.state(), DispatchState::RateChecked);

        ctx.advance(DispatchState::IdentityChecked);
        assert_eq!(ctx.state(), DispatchState::RateChecked);
    }

    #[test]
    fn test_reject_finishes_and_tags_response() {
        let mut ctx = ctx();
        ctx.advance(DispatchState::IdentityChecked);

        let response = ctx.reject(GatewayError::RateLimited {
            retry_after: Duration::from_secs(5),
            limit: 10,
        });

        assert_eq!(ctx.state(), DispatchState::Done);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.extensions().get::<Outcome>(),
            Some(&Outcome("rate_limited"))
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::of(&GatewayError::MissingIdentity).0, "unauthorized");
        assert_eq!(Outcome::of(&GatewayError::Unmatched("/x".into())).0, "unmatched");
        assert_eq!(
            Outcome::of(&GatewayError::BackendTimeout("svc".into())).0,
            "gateway_timeout"
        );
    }

    #[test]
    fn test_missing_context_is_internal_error() {
        assert_eq!(
            missing_context().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
