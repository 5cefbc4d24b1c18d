//! Rate limiting stage.
//!
//! # Keys
//!
//! - Protected paths: `id:<identity>`, so a caller's budget follows them
//!   across addresses
//! - Public paths: `addr:<client address>` (see [`super::ip`])
//!
//! # Response Headers
//!
//! On rejection (429):
//! - `Retry-After`: whole seconds until the key's window resets
//! - `X-RateLimit-Limit`: configured limit
//! - `X-RateLimit-Remaining`: `0`
//!
//! Admitted responses carry `X-RateLimit-Limit` and `X-RateLimit-Remaining`
//! unless the backend already set them.
//!
//! Admission is final: a request that later fails upstream has still used
//! its slot.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::{trace, warn};

use super::context::{DispatchState, RequestContextExt, missing_context};
use crate::error::GatewayError;
use crate::identity::Caller;
use crate::metrics;
use crate::rate_limiter::{Admission, FixedWindowLimiter};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Layer installing the rate limiting stage.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(FixedWindowLimiter::new(100, Duration::from_secs(60), 100_000));
/// let pipeline = ServiceBuilder::new()
///     .layer(RateLimitLayer::new(limiter))
///     .service(handler);
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<FixedWindowLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<FixedWindowLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<FixedWindowLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let limit = self.limiter.limit();

        let Some(ctx) = req.dispatch_context_mut() else {
            return Box::pin(async { Ok(missing_context()) });
        };

        let (key, scope) = match ctx.caller.as_ref().and_then(Caller::identity) {
            Some(identity) => (format!("id:{identity}"), "identity"),
            None => (format!("addr:{}", ctx.client_addr), "address"),
        };

        match self.limiter.admit(&key) {
            Admission::Admitted { remaining } => {
                trace!(request_id = %ctx.request_id, key = %key, remaining, "Request admitted");
                ctx.advance(DispatchState::RateChecked);

                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move {
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    headers
                        .entry(RATE_LIMIT_LIMIT_HEADER)
                        .or_insert_with(|| HeaderValue::from(limit));
                    headers
                        .entry(RATE_LIMIT_REMAINING_HEADER)
                        .or_insert_with(|| HeaderValue::from(remaining));
                    Ok(response)
                })
            }
            Admission::Rejected { retry_after } => {
                warn!(
                    request_id = %ctx.request_id,
                    key = %key,
                    path = %ctx.path,
                    retry_after_secs = GatewayError::retry_after_secs(retry_after),
                    "Rate limit exceeded"
                );
                metrics::record_rate_limit_rejection(scope);

                let response = ctx.reject(GatewayError::RateLimited { retry_after, limit });
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::middleware::context::RequestContext;
    use axum::http::{StatusCode, header};
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    fn request(caller: Caller, client: &str) -> Request<Body> {
        let mut req = Request::builder().uri("/api/x").body(Body::empty()).unwrap();
        let mut ctx = RequestContext::new(
            "test".to_string(),
            "/api/x".to_string(),
            client.to_string(),
            matches!(caller, Caller::Public),
        );
        ctx.caller = Some(caller);
        ctx.advance(DispatchState::IdentityChecked);
        req.extensions_mut().insert(ctx);
        req
    }

    async fn ok(_req: Request<Body>) -> Result<Response<Body>, Infallible> {
        Ok(Response::new(Body::empty()))
    }

    #[tokio::test]
    async fn test_admitted_then_rejected_with_retry_after() {
        let limiter = Arc::new(FixedWindowLimiter::new(2, Duration::from_secs(60), 100));
        let layer = RateLimitLayer::new(limiter);
        let alice = || Caller::Identified(Identity::new("alice").unwrap());

        for remaining in ["1", "0"] {
            let response = layer
                .layer(tower::service_fn(ok))
                .oneshot(request(alice(), "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "2");
            assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], remaining);
        }

        let response = layer
            .layer(tower::service_fn(ok))
            .oneshot(request(alice(), "10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry: u64 = response.headers()[header::RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry >= 1);
    }

    #[tokio::test]
    async fn test_public_requests_keyed_by_address() {
        let limiter = Arc::new(FixedWindowLimiter::new(1, Duration::from_secs(60), 100));
        let layer = RateLimitLayer::new(limiter.clone());

        let first = layer
            .layer(tower::service_fn(ok))
            .oneshot(request(Caller::Public, "192.0.2.1"))
            .await
            .unwrap();
        let other_client = layer
            .layer(tower::service_fn(ok))
            .oneshot(request(Caller::Public, "192.0.2.2"))
            .await
            .unwrap();
        let repeat = layer
            .layer(tower::service_fn(ok))
            .oneshot(request(Caller::Public, "192.0.2.1"))
            .await
            .unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(other_client.status(), StatusCode::OK);
        assert_eq!(repeat.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limiter.tracked_keys(), 2);
    }
}
