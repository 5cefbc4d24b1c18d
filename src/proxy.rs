//! Outbound forwarding to backend services.
//!
//! # Service Discovery
//!
//! Route rules name a logical service (`registration-service`); the
//! [`ServiceRegistry`] maps those names to base URLs loaded from
//! configuration.
//!
//! # Forwarding Rules
//!
//! - Method, query string, body and end-to-end headers are kept
//! - Hop-by-hop headers and `Host` are dropped in both directions
//! - Bodies stream in both directions, nothing is buffered
//! - The timeout bounds the wait for the response head; on expiry the
//!   call is abandoned (504), any other transport failure is a 502
//! - No retries: a failed call is surfaced immediately
//!
//! Dropping the future returned by [`ProxyClient::forward`] (for instance
//! when the inbound client disconnects) drops the in-flight request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderMap, HeaderName};
use axum::http::{Method, Response};
use tracing::{debug, error, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Logical service name to base URL.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, String>,
}

impl ServiceRegistry {
    pub fn new(services: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|(name, url)| (name, url.trim_end_matches('/').to_string()))
                .collect(),
        }
    }

    pub fn resolve(&self, service: &str) -> Option<&str> {
        self.services.get(service).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// A request ready to leave the gateway.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub service: String,
    pub method: Method,
    /// Rewritten path plus the original query string.
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Body,
    pub timeout: Duration,
}

/// Proxy client wrapping a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
    registry: ServiceRegistry,
}

impl ProxyClient {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the TLS backend cannot be initialized.
    pub fn new(registry: ServiceRegistry, connect_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { client, registry })
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Forward a request and relay the backend's response.
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound` if the service has no registered URL
    /// - `BackendTimeout` if no response head arrives within the timeout
    /// - `BackendUnreachable` for connection and protocol failures
    pub async fn forward(&self, request: UpstreamRequest) -> GatewayResult<Response<Body>> {
        let base = self
            .registry
            .resolve(&request.service)
            .ok_or_else(|| GatewayError::ServiceNotFound(request.service.clone()))?;
        let url = format!("{base}{}", request.path_and_query);

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);

        debug!(service = %request.service, method = %request.method, url = %url, "Forwarding request");

        let mut outbound = self.client.request(request.method, &url).headers(headers);
        // Bodiless requests stay bodiless instead of becoming an empty chunked stream.
        if request.body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(request.body.into_data_stream()));
        }
        let pending = outbound.send();

        let started = Instant::now();
        let outcome = tokio::time::timeout(request.timeout, pending).await;
        metrics::record_upstream_duration(&request.service, started.elapsed().as_secs_f64());

        let upstream = match outcome {
            Err(_) => {
                warn!(service = %request.service, timeout_ms = request.timeout.as_millis() as u64, "Backend call timed out");
                metrics::record_upstream_failure(&request.service, "timeout");
                return Err(GatewayError::BackendTimeout(format!(
                    "{} did not respond within {:?}",
                    request.service, request.timeout
                )));
            }
            Ok(Err(e)) if e.is_timeout() => {
                metrics::record_upstream_failure(&request.service, "timeout");
                return Err(GatewayError::BackendTimeout(format!("{}: {e}", request.service)));
            }
            Ok(Err(e)) => {
                error!(service = %request.service, error = %e, connect = e.is_connect(), "Backend call failed");
                metrics::record_upstream_failure(&request.service, "unreachable");
                return Err(GatewayError::BackendUnreachable(format!(
                    "{}: {e}",
                    request.service
                )));
            }
            Ok(Ok(response)) => response,
        };

        relay(upstream)
    }
}

/// Convert a backend response into a gateway response, streaming the body.
fn relay(upstream: reqwest::Response) -> GatewayResult<Response<Body>> {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| GatewayError::Internal(format!("Failed to build relayed response: {e}")))?;
    *response.headers_mut() = headers;

    Ok(response)
}

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_registry_trims_trailing_slash() {
        let registry = ServiceRegistry::new([(
            "orders".to_string(),
            "http://orders:8080/".to_string(),
        )]);
        assert_eq!(registry.resolve("orders"), Some("http://orders:8080"));
        assert!(registry.resolve("billing").is_none());
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_unknown_service_is_bad_gateway() {
        let client = ProxyClient::new(ServiceRegistry::default(), Duration::from_secs(1)).unwrap();
        let result = client
            .forward(UpstreamRequest {
                service: "ghost".to_string(),
                method: Method::GET,
                path_and_query: "/".to_string(),
                headers: HeaderMap::new(),
                body: Body::empty(),
                timeout: Duration::from_secs(1),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::ServiceNotFound(ref s)) if s == "ghost"));
    }
}
