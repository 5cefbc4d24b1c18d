//! Gateway configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! Everything is read from the process environment (after loading an optional
//! `.env` file) with development defaults. The loaded configuration is
//! validated once, wrapped in an `Arc` and never mutated afterwards.
//!
//! # Routing
//!
//! - `REGISTRATION_SERVICE_URL`: base URL of the default backend
//! - `SERVICE_URLS`: additional `name=url` pairs, comma separated
//! - `ROUTES_FILE`: JSON array of route rules (default: `/api/**` to the
//!   registration service, first segment stripped)
//! - `PUBLIC_PATHS`: comma separated patterns that skip identity and session
//!
//! # Admission Control
//!
//! - `RATE_LIMIT`: requests per window per key (default: 100, 0 rejects all)
//! - `RATE_LIMIT_WINDOW_SECS`: window length (default: 60, at most 86400)
//! - `SESSION_TIMEOUT_MINUTES`: session lifetime (default: 30)
//! - `SESSION_AUTO_ESTABLISH`: issue a session when none is presented (default: true)
//! - `MAX_TRACKED_KEYS`: cap on limiter windows and on sessions (default: 100000)

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use axum::http::HeaderName;

use crate::error::{GatewayError, GatewayResult};
use crate::route_matcher::{PathSet, RouteRule, RouteTable};

/// Logical name of the default backend.
pub const REGISTRATION_SERVICE: &str = "registration-service";

/// Public endpoints of the registration and login flows, each with
/// everything below it.
const DEFAULT_PUBLIC_PATHS: [&str; 8] = [
    "/api/register/start/**",
    "/api/register/verify-otp/**",
    "/api/register/validate-username/**",
    "/api/register/initiate-payment/**",
    "/api/register/complete/**",
    "/api/login/send-otp/**",
    "/api/login/verify/**",
    "/api/login/continue-with-oldest-logout/**",
];

/// Longest accepted rate-limit window.
pub const MAX_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Gateway configuration.
///
/// # Example
///
/// ```rust,ignore
/// let config = GatewayConfig::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Listen host (default: "0.0.0.0")
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    // =========================================================================
    // Routing Configuration
    // =========================================================================
    /// Service discovery table: logical name to base URL.
    /// Always contains `registration-service`.
    pub services: BTreeMap<String, String>,

    /// Route rules in declaration order.
    pub routes: Vec<RouteRule>,

    /// Patterns exempt from identity extraction and session checks.
    pub public_paths: Vec<String>,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests admitted per window per key (default: 100)
    /// 0 rejects every request.
    pub rate_limit: u32,

    /// Fixed window length (default: 60 seconds)
    pub rate_limit_window: Duration,

    // =========================================================================
    // Identity & Session Configuration
    // =========================================================================
    /// Header carrying the caller identity (default: "X-User-ID")
    pub identity_header: String,

    /// Cookie consulted when the identity header is absent (default: "user_id")
    pub identity_cookie: String,

    /// Session cookie name (default: "SESSION_ID")
    pub session_cookie: String,

    /// Session lifetime in minutes (default: 30)
    pub session_timeout_minutes: u64,

    /// Establish a session when a protected request presents none (default: true).
    /// When false such requests are rejected with 401.
    pub session_auto_establish: bool,

    /// Cookie `Domain` attribute (default: none)
    pub cookie_domain: Option<String>,

    /// Cookie `Secure` attribute (default: true)
    pub cookie_secure: bool,

    /// Cookie `Max-Age`; `None` uses the session timeout.
    pub cookie_max_age: Option<Duration>,

    /// Header marking requests as having passed the gateway (default: "X-Gateway-Request")
    pub gateway_marker_header: String,

    // =========================================================================
    // Upstream Configuration
    // =========================================================================
    /// Maximum wait for a backend's response head (default: 30 seconds)
    pub upstream_timeout: Duration,

    /// TCP connect timeout towards backends (default: 2 seconds)
    pub upstream_connect_timeout: Duration,

    /// Maximum inbound request body size in bytes (default: 10MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // State Eviction Configuration
    // =========================================================================
    /// Interval of the background sweep over limiter windows and sessions (default: 30s)
    pub state_sweep_interval: Duration,

    /// Maximum keys held by the limiter, and maximum live sessions (default: 100000)
    pub max_tracked_keys: usize,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins ("*" allows all)
    pub cors_allowed_origins: Vec<String>,

    /// Trusted proxy CIDR ranges. Forwarding headers are honoured only from
    /// these networks; when empty they are ignored.
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for the Prometheus endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl GatewayConfig {
    /// Load configuration from environment variables with development defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if a value fails to parse, the routes
    /// file cannot be read, or validation fails.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let registration_url = env::var("REGISTRATION_SERVICE_URL")
            .unwrap_or_else(|_| "http://localhost:8081".to_string());
        let mut services = Self::parse_service_urls(&env::var("SERVICE_URLS").unwrap_or_default())?;
        services
            .entry(REGISTRATION_SERVICE.to_string())
            .or_insert(registration_url);

        let routes = match env::var("ROUTES_FILE").ok().filter(|p| !p.is_empty()) {
            Some(path) => Self::load_routes_file(Path::new(&path))?,
            None => Self::default_routes(),
        };

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,

            // Routing
            services,
            routes,
            public_paths: Self::parse_public_paths(),

            // Rate limiting
            rate_limit: Self::parse_env("RATE_LIMIT", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),

            // Identity & session
            identity_header: env::var("IDENTITY_HEADER").unwrap_or_else(|_| "X-User-ID".to_string()),
            identity_cookie: env::var("IDENTITY_COOKIE").unwrap_or_else(|_| "user_id".to_string()),
            session_cookie: env::var("SESSION_COOKIE").unwrap_or_else(|_| "SESSION_ID".to_string()),
            session_timeout_minutes: Self::parse_env("SESSION_TIMEOUT_MINUTES", 30)?,
            session_auto_establish: Self::parse_env("SESSION_AUTO_ESTABLISH", true)?,
            cookie_domain: env::var("COOKIE_DOMAIN").ok().filter(|d| !d.is_empty()),
            cookie_secure: Self::parse_env("COOKIE_SECURE", true)?,
            cookie_max_age: match env::var("COOKIE_MAX_AGE_SECS") {
                Ok(_) => Some(Duration::from_secs(Self::parse_env("COOKIE_MAX_AGE_SECS", 0)?)),
                Err(_) => None,
            },
            gateway_marker_header: env::var("GATEWAY_MARKER_HEADER")
                .unwrap_or_else(|_| "X-Gateway-Request".to_string()),

            // Upstream
            upstream_timeout: Duration::from_millis(Self::parse_env("UPSTREAM_TIMEOUT_MS", 30_000)?),
            upstream_connect_timeout: Duration::from_millis(Self::parse_env(
                "UPSTREAM_CONNECT_TIMEOUT_MS",
                2_000,
            )?),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 10 * 1024 * 1024)?, // 10MB

            // State eviction
            state_sweep_interval: Duration::from_secs(Self::parse_env(
                "STATE_SWEEP_INTERVAL_SECS",
                30,
            )?),
            max_tracked_keys: Self::parse_env("MAX_TRACKED_KEYS", 100_000)?,

            // Security
            cors_allowed_origins: Self::parse_cors_origins(),
            trusted_proxies: Self::parse_trusted_proxies(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 0)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if validation fails.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.rate_limit_window.is_zero() {
            return Err(GatewayError::Config(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_window > MAX_RATE_LIMIT_WINDOW {
            return Err(GatewayError::Config(format!(
                "RATE_LIMIT_WINDOW_SECS must be at most {}",
                MAX_RATE_LIMIT_WINDOW.as_secs()
            )));
        }

        if self.session_timeout_minutes == 0 {
            return Err(GatewayError::Config(
                "SESSION_TIMEOUT_MINUTES must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout.is_zero() {
            return Err(GatewayError::Config(
                "UPSTREAM_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        if self.max_tracked_keys == 0 {
            return Err(GatewayError::Config(
                "MAX_TRACKED_KEYS must be greater than 0".to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(GatewayError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.state_sweep_interval.is_zero() {
            return Err(GatewayError::Config(
                "STATE_SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        Self::header_name("IDENTITY_HEADER", &self.identity_header)?;
        Self::header_name("GATEWAY_MARKER_HEADER", &self.gateway_marker_header)?;
        Self::check_cookie_name("IDENTITY_COOKIE", &self.identity_cookie)?;
        Self::check_cookie_name("SESSION_COOKIE", &self.session_cookie)?;

        for rule in &self.routes {
            if !self.services.contains_key(&rule.target_service) {
                return Err(GatewayError::Config(format!(
                    "Route {} targets unknown service {:?}",
                    rule.path_pattern, rule.target_service
                )));
            }
        }

        for (name, url) in &self.services {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(GatewayError::Config(format!(
                    "Service {name} has a non-HTTP URL {url:?}"
                )));
            }
        }

        // Compile once so pattern and duplicate errors surface at startup.
        self.route_table()?;
        self.public_path_set()?;

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_minutes.saturating_mul(60))
    }

    /// Cookie `Max-Age`, defaulting to the session timeout.
    pub fn effective_cookie_max_age(&self) -> Duration {
        self.cookie_max_age.unwrap_or_else(|| self.session_timeout())
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Compile the configured routes.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` for invalid or duplicate patterns.
    pub fn route_table(&self) -> GatewayResult<RouteTable> {
        RouteTable::new(self.routes.clone())
    }

    /// Compile the public path patterns.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` for invalid patterns.
    pub fn public_path_set(&self) -> GatewayResult<PathSet> {
        PathSet::parse(&self.public_paths)
    }

    /// Parsed identity header name.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the name is not a valid header name.
    pub fn identity_header_name(&self) -> GatewayResult<HeaderName> {
        Self::header_name("IDENTITY_HEADER", &self.identity_header)
    }

    /// Parsed gateway marker header name.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the name is not a valid header name.
    pub fn marker_header_name(&self) -> GatewayResult<HeaderName> {
        Self::header_name("GATEWAY_MARKER_HEADER", &self.gateway_marker_header)
    }

    fn header_name(var: &str, value: &str) -> GatewayResult<HeaderName> {
        HeaderName::from_bytes(value.as_bytes())
            .map_err(|e| GatewayError::Config(format!("Invalid {var} {value:?}: {e}")))
    }

    /// Cookie names are RFC 6265 tokens.
    fn check_cookie_name(var: &str, value: &str) -> GatewayResult<()> {
        let valid = !value.is_empty()
            && value
                .bytes()
                .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b));
        if valid {
            Ok(())
        } else {
            Err(GatewayError::Config(format!(
                "Invalid {var} {value:?}: not a cookie token"
            )))
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| GatewayError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse `name=url` pairs.
    fn parse_service_urls(raw: &str) -> GatewayResult<BTreeMap<String, String>> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (name, url) = entry.split_once('=').ok_or_else(|| {
                    GatewayError::Config(format!("Invalid SERVICE_URLS entry {entry:?}"))
                })?;
                let (name, url) = (name.trim(), url.trim());
                if name.is_empty() || url.is_empty() {
                    return Err(GatewayError::Config(format!(
                        "Invalid SERVICE_URLS entry {entry:?}"
                    )));
                }
                Ok((name.to_string(), url.to_string()))
            })
            .collect()
    }

    /// Read route rules from a JSON file.
    fn load_routes_file(path: &Path) -> GatewayResult<Vec<RouteRule>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Cannot read ROUTES_FILE {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Config(format!("Invalid ROUTES_FILE {}: {e}", path.display()))
        })
    }

    /// Everything under `/api` goes to the registration service without the
    /// `/api` prefix.
    pub fn default_routes() -> Vec<RouteRule> {
        vec![RouteRule::new("/api/**", REGISTRATION_SERVICE, 1).with_header("X-Gateway-Request", "true")]
    }

    fn parse_public_paths() -> Vec<String> {
        match env::var("PUBLIC_PATHS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Parse trusted proxy CIDR ranges from environment variable.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (forwarding headers ignored, clients keyed by socket address)
    fn parse_trusted_proxies() -> Vec<String> {
        env::var("TRUSTED_PROXIES")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `GatewayConfig::from_env()` instead.
impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            // Routing
            services: BTreeMap::from([(
                REGISTRATION_SERVICE.to_string(),
                "http://localhost:8081".to_string(),
            )]),
            routes: Self::default_routes(),
            public_paths: DEFAULT_PUBLIC_PATHS.iter().map(|p| p.to_string()).collect(),
            // Rate limiting
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
            // Identity & session
            identity_header: "X-User-ID".to_string(),
            identity_cookie: "user_id".to_string(),
            session_cookie: "SESSION_ID".to_string(),
            session_timeout_minutes: 30,
            session_auto_establish: true,
            cookie_domain: None,
            cookie_secure: true,
            cookie_max_age: None,
            gateway_marker_header: "X-Gateway-Request".to_string(),
            // Upstream
            upstream_timeout: Duration::from_secs(30),
            upstream_connect_timeout: Duration::from_secs(2),
            max_request_body_size: 10 * 1024 * 1024, // 10MB
            // State eviction
            state_sweep_interval: Duration::from_secs(30),
            max_tracked_keys: 100_000,
            // Security
            cors_allowed_origins: vec!["*".to_string()],
            trusted_proxies: vec![],
            // Observability
            log_level: "info".to_string(),
            metrics_port: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = GatewayConfig::default();

        assert_eq!(config.port, 8080);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.session_timeout(), Duration::from_secs(30 * 60));
        assert_eq!(config.effective_cookie_max_age(), Duration::from_secs(1800));
        assert_eq!(config.public_paths.len(), 8);
        assert!(config.services.contains_key(REGISTRATION_SERVICE));
        assert!(!config.metrics_enabled());
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            ..GatewayConfig::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_validate_zero_window() {
        let config = GatewayConfig {
            rate_limit_window: Duration::ZERO,
            ..GatewayConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_WINDOW_SECS"));
    }

    #[test]
    fn test_validate_window_upper_bound() {
        let config = GatewayConfig {
            rate_limit_window: MAX_RATE_LIMIT_WINDOW,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());

        let config = GatewayConfig {
            rate_limit_window: Duration::from_secs(u64::MAX),
            ..GatewayConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most 86400"));
    }

    #[test]
    fn test_zero_rate_limit_is_valid() {
        let config = GatewayConfig {
            rate_limit: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_session_timeout() {
        let config = GatewayConfig {
            session_timeout_minutes: 0,
            ..GatewayConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SESSION_TIMEOUT_MINUTES"));
    }

    #[test]
    fn test_validate_route_to_unknown_service() {
        let config = GatewayConfig {
            routes: vec![RouteRule::new("/orders/**", "order-service", 0)],
            ..GatewayConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("order-service"));
    }

    #[test]
    fn test_validate_duplicate_patterns() {
        let config = GatewayConfig {
            routes: vec![
                RouteRule::new("/api/**", REGISTRATION_SERVICE, 1),
                RouteRule::new("/api/**", REGISTRATION_SERVICE, 0),
            ],
            ..GatewayConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_validate_bad_header_and_cookie_names() {
        let config = GatewayConfig {
            identity_header: "X User".to_string(),
            ..GatewayConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("IDENTITY_HEADER"));

        let config = GatewayConfig {
            session_cookie: "SESSION;ID".to_string(),
            ..GatewayConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("SESSION_COOKIE"));
    }

    #[test]
    fn test_parse_service_urls() {
        let services = GatewayConfig::parse_service_urls(
            " orders=http://orders:8080 , billing=http://billing:9000,",
        )
        .unwrap();

        assert_eq!(services.len(), 2);
        assert_eq!(services["orders"], "http://orders:8080");
        assert_eq!(services["billing"], "http://billing:9000");

        assert!(GatewayConfig::parse_service_urls("orders").is_err());
        assert!(GatewayConfig::parse_service_urls("=http://x").is_err());
    }

    #[test]
    fn test_routes_file_format() {
        let json = r#"[
            {"path_pattern": "/api/orders/**", "target_service": "orders",
             "strip_prefix_count": 2, "extra_headers": {"X-Tenant": "acme"}},
            {"path_pattern": "/health", "target_service": "orders"}
        ]"#;
        let rules: Vec<RouteRule> = serde_json::from_str(json).unwrap();

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].strip_prefix_count, 2);
        assert_eq!(rules[0].extra_headers["X-Tenant"], "acme");
        assert_eq!(rules[1].strip_prefix_count, 0);
        assert!(rules[1].extra_headers.is_empty());
    }

    #[test]
    fn test_metrics_addr() {
        assert!(GatewayConfig::default().metrics_addr().is_none());

        let config = GatewayConfig {
            metrics_port: 9090,
            ..GatewayConfig::default()
        };
        assert_eq!(config.metrics_addr().unwrap().port(), 9090);
    }
}
