//! Shared gateway state.
//!
//! Every component is constructed once from the validated configuration and
//! shared behind `Arc`; nothing here is reconfigured after startup.
//!
//! - **Identity**: extractor and public path set
//! - **Admission**: fixed-window limiter and session tracker
//! - **Routing**: compiled route table
//! - **Forwarding**: proxy client and service registry
//!
//! # Structured Concurrency
//!
//! A background task sweeps expired limiter windows and sessions. It is
//! tracked by a `TaskTracker` and stopped through a `CancellationToken`;
//! call `shutdown()` before exit.

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderName;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::identity::IdentityExtractor;
use crate::metrics;
use crate::middleware::TrustedProxyConfig;
use crate::proxy::{ProxyClient, ServiceRegistry};
use crate::rate_limiter::FixedWindowLimiter;
use crate::route_matcher::RouteTable;
use crate::session::{CookieSettings, SessionTracker};

/// Shared gateway state, cloned into every stage and handler.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config)?;
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub identity: Arc<IdentityExtractor>,
    pub limiter: Arc<FixedWindowLimiter>,
    pub sessions: Arc<SessionTracker>,
    pub routes: Arc<RouteTable>,
    pub proxy: Arc<ProxyClient>,
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    pub marker_header: HeaderName,
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build every component from `config` and start the sweep task.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Config` if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;

        let identity = IdentityExtractor::new(
            config.identity_header_name()?,
            config.identity_cookie.clone(),
            config.public_path_set()?,
        );
        let limiter = FixedWindowLimiter::new(
            config.rate_limit,
            config.rate_limit_window,
            config.max_tracked_keys,
        );
        let sessions = SessionTracker::new(
            config.session_timeout(),
            CookieSettings {
                name: config.session_cookie.clone(),
                secure: config.cookie_secure,
                domain: config.cookie_domain.clone(),
                max_age: config.effective_cookie_max_age(),
            },
            config.max_tracked_keys,
        );
        let routes = config.route_table()?;
        let proxy = ProxyClient::new(
            ServiceRegistry::new(config.services.clone()),
            config.upstream_connect_timeout,
        )?;

        let state = Self {
            identity: Arc::new(identity),
            limiter: Arc::new(limiter),
            sessions: Arc::new(sessions),
            routes: Arc::new(routes),
            proxy: Arc::new(proxy),
            trusted_proxies: Arc::new(TrustedProxyConfig::new(&config.trusted_proxies)),
            marker_header: config.marker_header_name()?,
            config: Arc::new(config),
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_sweep_task();

        Ok(state)
    }

    /// Spawn the periodic eviction sweep.
    ///
    /// Clones only the stores it sweeps, not the whole state.
    fn spawn_sweep_task(&self) {
        let limiter = self.limiter.clone();
        let sessions = self.sessions.clone();
        let period = self.config.state_sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("State sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        sweep_once(&limiter, &sessions, Instant::now());
                    }
                }
            }

            debug!("State sweep task shutting down");
        });
    }

    /// `false` once shutdown has begun.
    pub fn is_accepting(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    /// Stop background tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// One sweep over both stores. Returns `(windows, sessions)` removed.
pub fn sweep_once(limiter: &FixedWindowLimiter, sessions: &SessionTracker, now: Instant) -> (usize, usize) {
    let windows_removed = limiter.sweep_expired(now);
    let sessions_removed = sessions.sweep_expired(now);

    metrics::record_evictions("rate_limit", windows_removed);
    metrics::record_evictions("session", sessions_removed);
    metrics::set_tracked_state(limiter.tracked_keys(), sessions.active_sessions());

    trace!(
        windows_removed,
        sessions_removed,
        windows = limiter.tracked_keys(),
        sessions = sessions.active_sessions(),
        "State sweep complete"
    );

    (windows_removed, sessions_removed)
}
