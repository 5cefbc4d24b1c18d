//! Identity stage.
//!
//! Runs the [`IdentityExtractor`] and records the caller on the request
//! context. Protected paths without a usable identity end here with 401;
//! the request never reaches the rate limiter, the session tracker, or a
//! backend.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::context::{DispatchState, RequestContextExt, missing_context};
use crate::identity::{Caller, IdentityExtractor};

/// Layer installing the identity stage.
#[derive(Clone)]
pub struct IdentityLayer {
    extractor: Arc<IdentityExtractor>,
}

impl IdentityLayer {
    pub fn new(extractor: Arc<IdentityExtractor>) -> Self {
        Self { extractor }
    }
}

impl<S> Layer<S> for IdentityLayer {
    type Service = IdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdentityService {
            inner,
            extractor: self.extractor.clone(),
        }
    }
}

#[derive(Clone)]
pub struct IdentityService<S> {
    inner: S,
    extractor: Arc<IdentityExtractor>,
}

impl<S> Service<Request<Body>> for IdentityService<S>
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
        let result = self.extractor.extract(req.uri().path(), req.headers());

        let Some(ctx) = req.dispatch_context_mut() else {
            return Box::pin(async { Ok(missing_context()) });
        };

        match result {
            Ok(caller) => {
                match &caller {
                    Caller::Public => debug!(request_id = %ctx.request_id, "Public path, identity not required"),
                    Caller::Identified(identity) => {
                        debug!(request_id = %ctx.request_id, identity = %identity, "Caller identified");
                    }
                }
                ctx.caller = Some(caller);
                ctx.advance(DispatchState::IdentityChecked);

                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { inner.call(req).await })
            }
            Err(e) => {
                warn!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    client = %ctx.client_addr,
                    header = %self.extractor.header_name(),
                    "Rejecting request without caller identity"
                );
                let response = ctx.reject(e);
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::middleware::context::RequestContext;
    use crate::route_matcher::PathSet;
    use axum::http::{HeaderName, StatusCode};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    fn layer() -> IdentityLayer {
        IdentityLayer::new(Arc::new(IdentityExtractor::new(
            HeaderName::from_static("x-user-id"),
            "user_id",
            PathSet::parse(&["/api/login/**"]).unwrap(),
        )))
    }

    fn request(path: &str, identity: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(id) = identity {
            builder = builder.header("x-user-id", id);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        req.extensions_mut().insert(RequestContext::new(
            "test".to_string(),
            path.to_string(),
            "127.0.0.1".to_string(),
            false,
        ));
        req
    }

    #[tokio::test]
    async fn test_missing_identity_never_reaches_inner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let service = layer().layer(tower::service_fn(move |_req: Request<Body>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Infallible>(Response::new(Body::empty())) }
        }));

        let response = service.oneshot(request("/api/orders", Some("  "))).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_identified_caller_recorded() {
        let service = layer().layer(tower::service_fn(|req: Request<Body>| async move {
            let ctx = req.dispatch_context().unwrap();
            assert_eq!(ctx.state(), DispatchState::IdentityChecked);
            let id = ctx.caller.as_ref().and_then(Caller::identity).unwrap().to_string();
            Ok::<_, Infallible>(Response::new(Body::from(id)))
        }));

        let response = service.oneshot(request("/api/orders", Some("alice"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_public_path_passes_without_identity() {
        let service = layer().layer(tower::service_fn(|req: Request<Body>| async move {
            assert_eq!(req.dispatch_context().unwrap().caller, Some(Caller::Public));
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));

        let response = service.oneshot(request("/api/login/verify", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
