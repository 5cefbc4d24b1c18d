//! Session stage.
//!
//! Checks the session cookie of identified callers against the
//! [`SessionTracker`](crate::session::SessionTracker) and applies the
//! resulting cookie directive to the response on the way out:
//!
//! | Check   | Effect                                                        |
//! |---------|---------------------------------------------------------------|
//! | Valid   | pass through                                                  |
//! | Expired | 401, session cookie cleared (`Max-Age=0`)                     |
//! | Absent  | session + `Set-Cookie`, or 401 when auto-establish is off     |
//!
//! Public callers skip the check.

use axum::extract::{Request, State};
use axum::http::{Response, header};
use axum::middleware::Next;
use axum::response::Response as AxumResponse;
use tracing::{debug, error, warn};

use super::context::{DispatchState, RequestContextExt, missing_context};
use crate::error::GatewayError;
use crate::identity::{Caller, cookie_value};
use crate::session::{CookieDirective, CookieSettings, SessionCheck};
use crate::state::AppState;

pub async fn enforce_session(State(state): State<AppState>, mut req: Request, next: Next) -> AxumResponse {
    let settings = state.sessions.cookie_settings();
    let presented = cookie_value(req.headers(), &settings.name);

    let Some(ctx) = req.dispatch_context_mut() else {
        return missing_context();
    };

    let Some(identity) = ctx.caller.as_ref().and_then(Caller::identity).cloned() else {
        ctx.advance(DispatchState::SessionChecked);
        return next.run(req).await;
    };

    let directive = match state.sessions.check_session(&identity, presented.as_deref()) {
        SessionCheck::Valid => None,
        SessionCheck::Expired(clear) => {
            warn!(
                request_id = %ctx.request_id,
                identity = %identity,
                path = %ctx.path,
                "Session expired, re-authentication required"
            );
            let mut response = ctx.reject(GatewayError::SessionExpired);
            apply_directive(&mut response, &clear, settings);
            return response;
        }
        SessionCheck::Absent if state.config.session_auto_establish => {
            debug!(request_id = %ctx.request_id, identity = %identity, "Issuing session");
            Some(state.sessions.establish(&identity))
        }
        SessionCheck::Absent => {
            warn!(
                request_id = %ctx.request_id,
                identity = %identity,
                path = %ctx.path,
                "No session presented"
            );
            return ctx.reject(GatewayError::SessionRequired);
        }
    };

    ctx.advance(DispatchState::SessionChecked);
    let mut response = next.run(req).await;

    if let Some(directive) = directive {
        apply_directive(&mut response, &directive, settings);
    }
    response
}

/// Append the directive as a `Set-Cookie` header, keeping any cookies the
/// backend set.
pub fn apply_directive<B>(response: &mut Response<B>, directive: &CookieDirective, settings: &CookieSettings) {
    match directive.to_header_value(settings) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(e) => error!(error = %e, "Dropping session cookie directive"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use std::time::Duration;

    #[test]
    fn test_apply_directive_appends() {
        let settings = CookieSettings {
            name: "SESSION_ID".to_string(),
            secure: false,
            domain: None,
            max_age: Duration::from_secs(60),
        };
        let mut response = Response::builder()
            .header(header::SET_COOKIE, "backend=1")
            .body(Body::empty())
            .unwrap();

        apply_directive(&mut response, &CookieDirective::Clear, &settings);

        let cookies: Vec<_> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies[0], "backend=1");
        assert!(cookies[1].starts_with("SESSION_ID="));
        assert!(cookies[1].contains("Max-Age=0"));
        assert!(!cookies[1].contains("Secure"));
    }
}
