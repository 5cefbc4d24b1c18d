//! Session tracking and cookie directives.
//!
//! The tracker maps session ids (the value of the session cookie) to the
//! identity they were issued to and when. It never writes to the transport:
//! every decision that touches the cookie comes back as a
//! [`CookieDirective`] that the filter pipeline applies to the response.
//!
//! A record is expired once `now - issued_at > timeout`. An unknown session
//! id, or a session presented by a different identity, is treated the same
//! as an expired one and the cookie is cleared.
//!
//! Each identity holds at most one live session: establishing again hands
//! back the existing id. When the tracker is full after a sweep, the oldest
//! session is evicted so a new identity is never locked out.

use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use cookie::Cookie;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::identity::Identity;
use crate::metrics;

/// Cookie attributes shared by every directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub secure: bool,
    pub domain: Option<String>,
    pub max_age: Duration,
}

/// Instruction to set or clear the session cookie on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieDirective {
    Set { value: String },
    Clear,
}

impl CookieDirective {
    /// Render as a `Set-Cookie` header value: always `HttpOnly` and `Path=/`,
    /// `Secure` and `Domain` per configuration, `Max-Age` from configuration
    /// or 0 when clearing.
    pub fn to_header_value(&self, settings: &CookieSettings) -> GatewayResult<HeaderValue> {
        let (value, max_age_secs) = match self {
            CookieDirective::Set { value } => (
                value.clone(),
                i64::try_from(settings.max_age.as_secs()).unwrap_or(i64::MAX),
            ),
            CookieDirective::Clear => (String::new(), 0),
        };

        let mut builder = Cookie::build((settings.name.clone(), value))
            .http_only(true)
            .secure(settings.secure)
            .path("/")
            .max_age(cookie::time::Duration::seconds(max_age_secs));
        if let Some(domain) = &settings.domain {
            builder = builder.domain(domain.clone());
        }

        HeaderValue::from_str(&builder.build().to_string())
            .map_err(|e| GatewayError::Internal(format!("Unencodable session cookie: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub identity: Identity,
    pub issued_at: Instant,
}

/// Outcome of checking a request's session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCheck {
    Valid,
    /// Carries the directive clearing the stale cookie.
    Expired(CookieDirective),
    Absent,
}

/// Tracks issued sessions.
#[derive(Debug)]
pub struct SessionTracker {
    timeout: Duration,
    cookie: CookieSettings,
    max_sessions: usize,
    sessions: DashMap<String, SessionRecord>,
    /// Live session id per identity.
    by_identity: DashMap<Identity, String>,
}

impl SessionTracker {
    pub fn new(timeout: Duration, cookie: CookieSettings, max_sessions: usize) -> Self {
        Self {
            timeout,
            cookie,
            max_sessions,
            sessions: DashMap::new(),
            by_identity: DashMap::new(),
        }
    }

    pub fn cookie_settings(&self) -> &CookieSettings {
        &self.cookie
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn check_session(&self, identity: &Identity, session_cookie: Option<&str>) -> SessionCheck {
        self.check_session_at(identity, session_cookie, Instant::now())
    }

    /// Check a session against an explicit clock reading.
    pub fn check_session_at(
        &self,
        identity: &Identity,
        session_cookie: Option<&str>,
        now: Instant,
    ) -> SessionCheck {
        let Some(session_id) = session_cookie.map(str::trim).filter(|s| !s.is_empty()) else {
            return SessionCheck::Absent;
        };

        match self.sessions.entry(session_id.to_string()) {
            Entry::Vacant(_) => {
                debug!(identity = %identity, "Unknown session id presented");
                SessionCheck::Expired(CookieDirective::Clear)
            }
            Entry::Occupied(entry) => {
                let record = entry.get();
                let same_owner: bool = record
                    .identity
                    .as_str()
                    .as_bytes()
                    .ct_eq(identity.as_str().as_bytes())
                    .into();

                if !same_owner {
                    warn!(identity = %identity, "Session presented by a different identity");
                    return SessionCheck::Expired(CookieDirective::Clear);
                }

                if now.saturating_duration_since(record.issued_at) > self.timeout {
                    debug!(identity = %identity, "Session expired");
                    entry.remove();
                    self.forget(identity, session_id);
                    return SessionCheck::Expired(CookieDirective::Clear);
                }

                SessionCheck::Valid
            }
        }
    }

    pub fn establish(&self, identity: &Identity) -> CookieDirective {
        self.establish_at(identity, Instant::now())
    }

    /// Issue a session for `identity`, reusing its live one if it has one.
    ///
    /// A full tracker is swept first; if nothing has expired the oldest
    /// session is evicted to make room.
    pub fn establish_at(&self, identity: &Identity, now: Instant) -> CookieDirective {
        if let Some(session_id) = self.live_session_for(identity, now) {
            debug!(identity = %identity, "Reusing live session");
            return CookieDirective::Set { value: session_id };
        }

        if self.sessions.len() >= self.max_sessions {
            self.sweep_expired(now);
            if self.sessions.len() >= self.max_sessions {
                warn!(
                    max_sessions = self.max_sessions,
                    "Session capacity exhausted, evicting oldest session"
                );
                self.evict_oldest();
            }
        }

        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionRecord {
                identity: identity.clone(),
                issued_at: now,
            },
        );
        self.by_identity.insert(identity.clone(), session_id.clone());
        debug!(identity = %identity, "Established new session");

        CookieDirective::Set { value: session_id }
    }

    fn live_session_for(&self, identity: &Identity, now: Instant) -> Option<String> {
        let session_id = self.by_identity.get(identity).map(|e| e.value().clone())?;
        let record = self.sessions.get(&session_id)?;
        let live = record.identity == *identity
            && now.saturating_duration_since(record.issued_at) <= self.timeout;
        live.then_some(session_id)
    }

    fn evict_oldest(&self) {
        let oldest = self
            .sessions
            .iter()
            .min_by_key(|e| e.value().issued_at)
            .map(|e| e.key().clone());

        if let Some(session_id) = oldest
            && let Some((_, record)) = self.sessions.remove(&session_id)
        {
            self.forget(&record.identity, &session_id);
            metrics::record_evictions("session", 1);
        }
    }

    /// Drop the index entry for `identity` if it still points at `session_id`.
    fn forget(&self, identity: &Identity, session_id: &str) {
        self.by_identity.remove_if(identity, |_, id| id == session_id);
    }

    /// Drop every expired session. Returns the number removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.sessions.retain(|session_id, record| {
            let keep = now.saturating_duration_since(record.issued_at) <= timeout;
            if !keep {
                expired.push((record.identity.clone(), session_id.clone()));
            }
            keep
        });

        for (identity, session_id) in &expired {
            self.forget(identity, session_id);
        }
        expired.len()
    }
}
