//! Client address resolution.
//!
//! The client address keys the rate limiter on public paths, so it must not
//! be freely spoofable.
//!
//! # Resolution Order
//!
//! 1. When forwarding headers are trusted (see below): the first entry of
//!    `X-Forwarded-For`, then `X-Real-IP`
//! 2. The TCP peer address from axum's `ConnectInfo`
//! 3. [`UNKNOWN_IP`]
//!
//! Forwarding headers are trusted only when the TCP peer falls inside one
//! of the configured `TRUSTED_PROXIES` ranges. With none configured every
//! client is keyed by its socket address no matter what headers it sends.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Fallback value when no client address can be determined.
///
/// All such requests share one rate-limit key.
pub const UNKNOWN_IP: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `10.0.0.0/8`, `::1/128`, or a bare address (implicit /32 or /128).
    ///
    /// Returns `None` if the format is invalid.
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();
        let (addr, prefix) = match cidr.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr, None),
        };

        let network: IpAddr = addr.parse().ok()?;
        let max_prefix = match network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = match prefix {
            Some(p) => p.parse().ok()?,
            None => max_prefix,
        };
        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

/// Networks whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Build from CIDR strings. Invalid entries are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy validation enabled");
        }

        Self { ranges }
    }

    /// `true` if `ip` is inside a configured range. Nothing is trusted when
    /// no ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Where a client address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractedIp<'a> {
    FromXff(&'a str),
    FromRealIp(&'a str),
    NotFound,
}

/// Read the forwarding headers without allocating.
#[inline]
fn extract_ip_from_headers<B>(req: &Request<B>) -> ExtractedIp<'_> {
    // "client, proxy1, proxy2": the first entry is the client
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_ip) = value.split(',').next().map(str::trim)
        && !first_ip.is_empty()
    {
        return ExtractedIp::FromXff(first_ip);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return ExtractedIp::FromRealIp(value.trim());
    }

    ExtractedIp::NotFound
}

/// TCP peer recorded by `into_make_service_with_connect_info`.
fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Resolve the client address for `req`.
///
/// Returns `Cow::Borrowed(UNKNOWN_IP)` when nothing identifies the client.
pub fn client_address<B>(req: &Request<B>, trusted_proxies: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_addr(req);

    let headers_trusted = peer.is_some_and(|addr| trusted_proxies.is_trusted(&addr.ip()));

    if headers_trusted {
        match extract_ip_from_headers(req) {
            ExtractedIp::FromXff(ip) | ExtractedIp::FromRealIp(ip) => {
                return Cow::Owned(ip.to_string());
            }
            ExtractedIp::NotFound => {}
        }
    } else if extract_ip_from_headers(req) != ExtractedIp::NotFound {
        debug!(
            peer = ?peer,
            "Ignoring forwarding headers from untrusted peer"
        );
    }

    match peer {
        Some(addr) => Cow::Owned(addr.ip().to_string()),
        None => Cow::Borrowed(UNKNOWN_IP),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(headers: &[(&str, &str)], peer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut req = builder.body(Body::empty()).unwrap();
        if let Some(peer) = peer {
            req.extensions_mut()
                .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        }
        req
    }

    fn proxies(cidrs: &[&str]) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&cidrs.iter().map(|c| c.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_cidr_parse() {
        assert_eq!(CidrRange::parse("10.0.0.0/8").unwrap().prefix_len, 8);
        assert_eq!(CidrRange::parse("::1/128").unwrap().prefix_len, 128);
        assert_eq!(CidrRange::parse("192.168.1.1").unwrap().prefix_len, 32);
        assert!(CidrRange::parse("not-an-ip").is_none());
        assert!(CidrRange::parse("10.0.0.0/33").is_none());
    }

    #[test]
    fn test_cidr_contains() {
        let cidr = CidrRange::parse("172.16.0.0/12").unwrap();
        assert!(cidr.contains(&"172.16.0.1".parse().unwrap()));
        assert!(cidr.contains(&"172.31.255.255".parse().unwrap()));
        assert!(!cidr.contains(&"172.32.0.1".parse().unwrap()));
        assert!(!cidr.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_no_trusted_proxies_ignores_forwarding_headers() {
        let req = request(
            &[("x-forwarded-for", "203.0.113.7"), ("x-real-ip", "203.0.113.8")],
            Some("192.0.2.10:5000"),
        );
        let proxies = TrustedProxyConfig::default();
        assert!(!proxies.is_trusted(&"192.0.2.10".parse().unwrap()));
        assert_eq!(client_address(&req, &proxies), "192.0.2.10");
    }

    #[test]
    fn test_trusted_peer_uses_first_forwarded_for_entry() {
        let req = request(
            &[("x-forwarded-for", " 203.0.113.7 , 10.0.0.1")],
            Some("10.0.0.1:5000"),
        );
        assert_eq!(client_address(&req, &proxies(&["10.0.0.0/8"])), "203.0.113.7");
    }

    #[test]
    fn test_trusted_peer_forwarded_for() {
        let req = request(&[("x-real-ip", "198.51.100.4")], Some("10.1.2.3:443"));
        assert_eq!(client_address(&req, &proxies(&["10.0.0.0/8"])), "198.51.100.4");
    }

    #[test]
    fn test_untrusted_peer_uses_socket_address() {
        let req = request(&[("x-forwarded-for", "1.2.3.4")], Some("192.0.2.10:40000"));
        assert_eq!(client_address(&req, &proxies(&["10.0.0.0/8"])), "192.0.2.10");
    }

    #[test]
    fn test_no_headers_uses_peer() {
        let req = request(&[], Some("127.0.0.1:9999"));
        assert_eq!(client_address(&req, &TrustedProxyConfig::default()), "127.0.0.1");
    }

    #[test]
    fn test_unknown_without_peer_or_headers() {
        let req = request(&[], None);
        let addr = client_address(&req, &TrustedProxyConfig::default());
        assert_eq!(addr, UNKNOWN_IP);
        assert!(matches!(addr, Cow::Borrowed(_)));
    }

    #[test]
    fn test_blank_forwarded_for_falls_through() {
        let req = request(
            &[("x-forwarded-for", "   "), ("x-real-ip", "::1")],
            Some("10.0.0.1:5000"),
        );
        assert_eq!(client_address(&req, &proxies(&["10.0.0.0/8"])), "::1");
    }

    #[test]
    fn test_headers_without_peer_are_ignored() {
        let req = request(&[("x-forwarded-for", "1.2.3.4")], None);
        assert_eq!(client_address(&req, &TrustedProxyConfig::default()), UNKNOWN_IP);
    }

    #[test]
    fn test_enabled_proxies_without_peer_ignore_headers() {
        let req = request(&[("x-forwarded-for", "1.2.3.4")], None);
        assert_eq!(client_address(&req, &proxies(&["10.0.0.0/8"])), UNKNOWN_IP);
    }
}
