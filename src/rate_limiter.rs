//! Fixed-window rate limiter with per-key locking.
//!
//! # Algorithm
//!
//! Each key owns a window `{started_at, count}`:
//!
//! - No window, or `started_at + window <= now`: start a new window with
//!   `count = 1` and admit.
//! - Otherwise increment; admit while `count <= limit`, reject beyond it
//!   with the time left until the window resets.
//!
//! A limit of 0 rejects every request without creating any state.
//!
//! # Concurrency
//!
//! Windows live in a sharded [`DashMap`], each behind its own mutex. The
//! shard lock is only held long enough to fetch or insert the window, so
//! unrelated keys never serialize on each other while updates to a single
//! key are linearizable.
//!
//! The sweeper marks a window as evicted under the window's own lock before
//! removing it; a request that raced with the sweep sees the mark and
//! re-resolves the key instead of counting into a detached window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Admission decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted {
        /// Requests left in the current window.
        remaining: u32,
    },
    Rejected {
        /// Time until the key's window resets.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
    evicted: bool,
}

impl Window {
    /// `started_at + window <= now`, without adding to the `Instant`.
    fn has_elapsed(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.started_at) >= window
    }
}

/// Keyed fixed-window counter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    max_keys: usize,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl FixedWindowLimiter {
    /// Create a limiter admitting `limit` requests per `window` per key,
    /// tracking at most `max_keys` keys at once.
    pub fn new(limit: u32, window: Duration, max_keys: usize) -> Self {
        Self {
            limit,
            window,
            max_keys,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of keys currently holding a window.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn admit(&self, key: &str) -> Admission {
        self.admit_at(key, Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn admit_at(&self, key: &str, now: Instant) -> Admission {
        if self.limit == 0 {
            return Admission::Rejected {
                retry_after: self.window,
            };
        }

        loop {
            let Some(slot) = self.window_for(key, now) else {
                warn!(
                    key,
                    max_keys = self.max_keys,
                    "Rate limiter key capacity exhausted, rejecting new key"
                );
                return Admission::Rejected {
                    retry_after: self.window,
                };
            };

            let mut window = slot.lock();
            if window.evicted {
                // Lost a race with the sweeper; fetch the live window.
                continue;
            }

            if window.has_elapsed(self.window, now) {
                window.started_at = now;
                window.count = 0;
            }

            window.count = window.count.saturating_add(1);
            return if window.count <= self.limit {
                Admission::Admitted {
                    remaining: self.limit - window.count,
                }
            } else {
                Admission::Rejected {
                    retry_after: self
                        .window
                        .saturating_sub(now.saturating_duration_since(window.started_at)),
                }
            };
        }
    }

    /// Fetch or create the window for `key`. Returns `None` when the key is
    /// new and the map stays full even after an inline sweep.
    fn window_for(&self, key: &str, now: Instant) -> Option<Arc<Mutex<Window>>> {
        if let Some(existing) = self.windows.get(key) {
            return Some(Arc::clone(existing.value()));
        }

        if self.windows.len() >= self.max_keys {
            self.sweep_expired(now);
            if self.windows.len() >= self.max_keys {
                return None;
            }
        }

        let slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Window {
                    started_at: now,
                    count: 0,
                    evicted: false,
                }))
            });
        Some(Arc::clone(slot.value()))
    }

    /// Drop every window that has fully elapsed. Returns the number removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        let window = self.window;
        self.windows.retain(|_, slot| {
            let mut w = slot.lock();
            if w.has_elapsed(window, now) {
                w.evicted = true;
                false
            } else {
                true
            }
        });
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit windows");
        }
        removed
    }
}
