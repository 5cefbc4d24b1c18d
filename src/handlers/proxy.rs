//! Terminal pipeline handler: forward the routed request.

use axum::extract::{Request, State};
use axum::response::Response;
use tracing::debug;

use crate::error::GatewayError;
use crate::middleware::context::{DispatchState, Outcome, RequestContext};
use crate::middleware::{RequestTimeoutExt, missing_context};
use crate::proxy::UpstreamRequest;
use crate::state::AppState;

/// Send the request to its resolved backend and relay the response.
///
/// Reaching this handler without a resolved route is a wiring error and
/// yields 500; nothing is sent upstream in that case.
pub async fn forward(State(state): State<AppState>, req: Request) -> Response {
    let timeout = req.effective_timeout(state.config.upstream_timeout);
    let (mut parts, body) = req.into_parts();

    let Some(mut ctx) = parts.extensions.remove::<RequestContext>() else {
        return missing_context();
    };
    let Some(route) = ctx.route.clone() else {
        return ctx.reject(GatewayError::Internal(
            "Request reached the proxy without a route".to_string(),
        ));
    };

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{}?{query}", route.forward_path),
        None => route.forward_path.clone(),
    };

    ctx.advance(DispatchState::Forwarded);
    debug!(
        request_id = %ctx.request_id,
        service = route.target_service(),
        target = %path_and_query,
        timeout_ms = timeout.as_millis() as u64,
        "Forwarding request"
    );

    let result = state
        .proxy
        .forward(UpstreamRequest {
            service: route.target_service().to_string(),
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
            timeout,
        })
        .await;

    match result {
        Ok(mut response) => {
            ctx.advance(DispatchState::Done);
            response.extensions_mut().insert(Outcome::FORWARDED);
            response
        }
        Err(e) => ctx.reject(e),
    }
}
