//! Header injection stage.
//!
//! Prepares the outbound headers for a routed request:
//!
//! 1. Remove any client-supplied identity and marker headers, so neither
//!    can be forged through the gateway
//! 2. Set the marker header to `true`
//! 3. Forward the verified identity (identified callers only)
//! 4. Apply the route's extra headers, replacing client values
//!
//! The identity header stripped in step 1 is the same one the identity stage
//! read, so a verified caller's value is re-added in step 3 in trimmed form.

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::trace;

use super::context::{RequestContextExt, missing_context};
use crate::error::GatewayError;
use crate::identity::Caller;
use crate::state::AppState;

const MARKER_VALUE: &str = "true";

pub async fn inject_gateway_headers(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(ctx) = req.dispatch_context() else {
        return missing_context();
    };
    let identity = ctx
        .caller
        .as_ref()
        .and_then(Caller::identity)
        .map(|id| HeaderValue::from_str(id.as_str()));
    let route = ctx.route.as_ref().map(|r| r.route.clone());
    let request_id = ctx.request_id.clone();

    let identity = match identity.transpose() {
        Ok(identity) => identity,
        Err(e) => {
            let error = GatewayError::Internal(format!("Identity is not a valid header value: {e}"));
            return match req.dispatch_context_mut() {
                Some(ctx) => ctx.reject(error),
                None => missing_context(),
            };
        }
    };

    let identity_header = state.identity.header_name();
    let headers = req.headers_mut();
    headers.remove(identity_header);
    headers.remove(&state.marker_header);

    headers.insert(state.marker_header.clone(), HeaderValue::from_static(MARKER_VALUE));
    if let Some(value) = identity {
        headers.insert(identity_header.clone(), value);
    }
    if let Some(route) = route {
        for (name, value) in &route.headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    trace!(request_id = %request_id, headers = headers.len(), "Gateway headers injected");
    next.run(req).await
}
