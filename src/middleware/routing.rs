//! Routing stage: resolve the target service and rewritten path.
//!
//! An unmatched path ends the request with 404; no backend is contacted.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use super::context::{DispatchState, RequestContextExt, missing_context};
use crate::error::GatewayError;
use crate::state::AppState;

pub async fn resolve_route(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let Some(ctx) = req.dispatch_context_mut() else {
        return missing_context();
    };

    match state.routes.resolve(&ctx.path) {
        Some(resolved) => {
            debug!(
                request_id = %ctx.request_id,
                pattern = %resolved.route.pattern,
                service = resolved.target_service(),
                forward_path = %resolved.forward_path,
                "Route resolved"
            );
            ctx.route = Some(resolved);
            ctx.advance(DispatchState::Routed);
            next.run(req).await
        }
        None => {
            warn!(request_id = %ctx.request_id, path = %ctx.path, "No route matches path");
            let path = ctx.path.clone();
            ctx.reject(GatewayError::Unmatched(path))
        }
    }
}
