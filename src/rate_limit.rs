//! Sliding-window-log rate limiting.
//!
//! Every client key owns the timestamps (unix ms) of its admitted requests
//! that may still fall inside the trailing window. A request is admitted only
//! while fewer than `max_requests` of them are younger than `window_ms`.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::client_key::resolve_client_key;
use crate::config::ConfigError;
use crate::error::ApiError;
use crate::metrics::{RATE_LIMIT_ADMITTED, RATE_LIMIT_REJECTED, TRACKED_CLIENTS};
use crate::state::AppState;

pub const DEFAULT_WINDOW_MS: u64 = 900_000;
pub const DEFAULT_MAX_REQUESTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u32,
    // 0 disables the cap
    pub max_tracked_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_tracked_clients: 0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_ms == 0 {
            return Err(ConfigError::InvalidWindow);
        }
        if self.max_requests == 0 {
            return Err(ConfigError::InvalidMaxRequests);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject,
}

// Per-client request log. The DashMap entry guard holds the shard lock for the
// whole prune-count-append step, so two checks for one key never interleave.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    window_ms: i64,
    log: DashMap<String, VecDeque<i64>>,
    // keys in `log` plus slots reserved for keys about to be inserted
    slots: AtomicUsize,
    last_capacity_sweep: AtomicI64,
}

// Minimum gap between sweeps forced by a full request log
const CAPACITY_SWEEP_INTERVAL_MS: i64 = 1_000;

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            window_ms: i64::try_from(config.window_ms).unwrap_or(i64::MAX),
            log: DashMap::new(),
            slots: AtomicUsize::new(0),
            last_capacity_sweep: AtomicI64::new(i64::MIN),
        })
    }

    /// Decide whether a request from `key` arriving at `now_ms` is admitted.
    ///
    /// Expired timestamps are dropped on both paths; `now_ms` is recorded
    /// only when the request is admitted.
    pub fn check(&self, key: &str, now_ms: i64) -> Decision {
        let Some(mut timestamps) = self.entry_for(key, now_ms) else {
            warn!(client = %key, tracked = self.log.len(), "rate limiter is tracking too many clients");
            return Decision::Reject;
        };
        timestamps.retain(|&t| self.is_live(t, now_ms));

        if timestamps.len() >= self.config.max_requests as usize {
            return Decision::Reject;
        }

        timestamps.push_back(now_ms);
        Decision::Admit
    }

    /// Drop every client whose log is empty once pruned against `now_ms`.
    /// Returns how many clients were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut removed = 0;
        self.log.retain(|_, timestamps| {
            timestamps.retain(|&t| self.is_live(t, now_ms));
            let keep = !timestamps.is_empty();
            if !keep {
                removed += 1;
            }
            keep
        });
        self.slots.fetch_sub(removed, Ordering::AcqRel);
        removed
    }

    pub fn tracked_clients(&self) -> usize {
        self.log.len()
    }

    // Stored entries for `key`, including any not yet pruned
    pub fn request_count(&self, key: &str) -> usize {
        self.log.get(key).map(|entry| entry.len()).unwrap_or(0)
    }

    fn is_live(&self, timestamp: i64, now_ms: i64) -> bool {
        now_ms.saturating_sub(timestamp) < self.window_ms
    }

    // Locked entry for `key`, or None when a new key finds the log full.
    // A slot is reserved before the insert so the cap holds under contention.
    fn entry_for(&self, key: &str, now_ms: i64) -> Option<RefMut<'_, String, VecDeque<i64>>> {
        if let Some(existing) = self.log.get_mut(key) {
            return Some(existing);
        }

        if !self.reserve_slot() && !(self.sweep_at_capacity(now_ms) && self.reserve_slot()) {
            return None;
        }

        match self.log.entry(key.to_owned()) {
            // another request created it in the meantime
            Entry::Occupied(entry) => {
                self.slots.fetch_sub(1, Ordering::AcqRel);
                Some(entry.into_ref())
            }
            Entry::Vacant(entry) => Some(entry.insert(VecDeque::new())),
        }
    }

    fn reserve_slot(&self) -> bool {
        let cap = self.config.max_tracked_clients;
        if cap == 0 {
            self.slots.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.slots
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < cap).then_some(used + 1)
            })
            .is_ok()
    }

    // At most one forced sweep per CAPACITY_SWEEP_INTERVAL_MS, so a stream of
    // new keys cannot lock every shard on every request
    fn sweep_at_capacity(&self, now_ms: i64) -> bool {
        let last = self.last_capacity_sweep.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < CAPACITY_SWEEP_INTERVAL_MS {
            return false;
        }
        if self
            .last_capacity_sweep
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let removed = self.sweep(now_ms);
        debug!(removed, "swept request log at capacity");
        removed > 0
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Background task that evicts idle clients
pub fn spawn_sweeper(limiter: Arc<SlidingWindowLimiter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        debug!(interval = ?every, "rate limit sweeper started");

        loop {
            ticker.tick().await;
            let removed = limiter.sweep(now_ms());
            TRACKED_CLIENTS.set(limiter.tracked_clients() as f64);
            if removed > 0 {
                debug!(
                    removed,
                    remaining = limiter.tracked_clients(),
                    "evicted idle rate limit clients"
                );
            }
        }
    })
}

// First stage of the pipeline, a rejection never reaches CORS or the routes
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let key = resolve_client_key(
        request.headers(),
        peer,
        state.trusted_client_header.as_ref(),
    );

    match state.limiter.check(&key, now_ms()) {
        Decision::Admit => {
            RATE_LIMIT_ADMITTED.inc();
            TRACKED_CLIENTS.set(state.limiter.tracked_clients() as f64);
            next.run(request).await
        }
        Decision::Reject => {
            RATE_LIMIT_REJECTED.inc();
            TRACKED_CLIENTS.set(state.limiter.tracked_clients() as f64);
            warn!(client = %key, "rate limit exceeded");
            ApiError::RateLimited.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(window_ms: u64, max_requests: u32) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitConfig {
            window_ms,
            max_requests,
            max_tracked_clients: 0,
        })
        .unwrap()
    }

    #[test]
    fn default_config() {
        let config = RateLimitConfig::default();
        assert_eq!(config.window_ms, 900_000);
        assert_eq!(config.max_requests, 100);
    }

    #[test]
    fn rejects_degenerate_config() {
        let zero_window = RateLimitConfig {
            window_ms: 0,
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            SlidingWindowLimiter::new(zero_window),
            Err(ConfigError::InvalidWindow)
        ));

        let zero_max = RateLimitConfig {
            max_requests: 0,
            ..RateLimitConfig::default()
        };
        assert!(matches!(
            SlidingWindowLimiter::new(zero_max),
            Err(ConfigError::InvalidMaxRequests)
        ));
    }

    #[test]
    fn walkthrough_window_1000_max_2() {
        let limiter = limiter(1000, 2);
        assert_eq!(limiter.check("A", 0), Decision::Admit);
        assert_eq!(limiter.check("A", 100), Decision::Admit);
        assert_eq!(limiter.check("A", 200), Decision::Reject);
        assert_eq!(limiter.check("A", 1001), Decision::Admit);
        // t=0 expired, t=100 and t=1001 remain
        assert_eq!(limiter.request_count("A"), 2);
    }

    #[test]
    fn recovers_after_window_elapses() {
        let (n, w) = (5, 10_000);
        let t0 = 1_700_000_000_000;

        let early = limiter(w, n);
        for _ in 0..n {
            assert_eq!(early.check("client", t0), Decision::Admit);
        }
        assert_eq!(early.check("client", t0 + w as i64 - 1), Decision::Reject);

        let late = limiter(w, n);
        for _ in 0..n {
            assert_eq!(late.check("client", t0), Decision::Admit);
        }
        assert_eq!(late.check("client", t0 + w as i64 + 1), Decision::Admit);
    }

    #[test]
    fn timestamp_exactly_window_old_is_expired() {
        let limiter = limiter(1000, 1);
        assert_eq!(limiter.check("k", 0), Decision::Admit);
        assert_eq!(limiter.check("k", 999), Decision::Reject);
        assert_eq!(limiter.check("k", 1000), Decision::Admit);
    }

    #[test]
    fn clients_are_independent() {
        let limiter = limiter(1000, 2);
        assert_eq!(limiter.check("a", 0), Decision::Admit);
        assert_eq!(limiter.check("a", 1), Decision::Admit);
        assert_eq!(limiter.check("a", 2), Decision::Reject);

        assert_eq!(limiter.check("b", 2), Decision::Admit);
        assert_eq!(limiter.check("b", 3), Decision::Admit);
        assert_eq!(limiter.check("b", 4), Decision::Reject);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn reject_at_ceiling_never_grows_the_log() {
        let limiter = limiter(60_000, 3);
        for _ in 0..3 {
            assert_eq!(limiter.check("k", 500), Decision::Admit);
        }
        for _ in 0..50 {
            assert_eq!(limiter.check("k", 500), Decision::Reject);
            assert_eq!(limiter.request_count("k"), 3);
        }
    }

    #[test]
    fn reject_still_prunes_expired_entries() {
        let limiter = limiter(1000, 2);
        limiter.check("k", 0);
        limiter.check("k", 900);
        // t=0 drops out, t=900 stays, count 1 < 2 so this is admitted
        assert_eq!(limiter.check("k", 1500), Decision::Admit);
        // count is 2 now, rejected, and nothing stale is left behind
        assert_eq!(limiter.check("k", 1600), Decision::Reject);
        assert_eq!(limiter.request_count("k"), 2);
    }

    #[test]
    fn no_entry_before_first_request() {
        let limiter = limiter(1000, 2);
        assert_eq!(limiter.tracked_clients(), 0);
        assert_eq!(limiter.request_count("nobody"), 0);
        limiter.check("somebody", 0);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn ceiling_holds_for_any_trailing_window() {
        let (w, n) = (100, 4);
        let limiter = limiter(w, n);
        let mut admitted = Vec::new();
        for t in 0..1000 {
            if limiter.check("k", t) == Decision::Admit {
                admitted.push(t);
            }
        }
        for start in 0..1000 {
            let inside = admitted
                .iter()
                .filter(|&&t| t >= start && t < start + w as i64)
                .count();
            assert!(inside <= n as usize, "window at {start} holds {inside}");
        }
    }

    #[test]
    fn sweep_removes_idle_clients_only() {
        let limiter = limiter(1000, 5);
        limiter.check("idle", 0);
        limiter.check("busy", 1500);

        assert_eq!(limiter.sweep(2000), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.request_count("busy"), 1);
        assert_eq!(limiter.request_count("idle"), 0);
    }

    #[test]
    fn cap_sweeps_before_refusing_new_clients() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            window_ms: 1000,
            max_requests: 5,
            max_tracked_clients: 2,
        })
        .unwrap();

        assert_eq!(limiter.check("a", 0), Decision::Admit);
        assert_eq!(limiter.check("b", 0), Decision::Admit);
        assert_eq!(limiter.check("c", 10), Decision::Reject);
        // known clients keep working while the map is full
        assert_eq!(limiter.check("a", 20), Decision::Admit);

        // "b" has gone idle, so the sweep makes room for "c"
        assert_eq!(limiter.check("a", 1500), Decision::Admit);
        assert_eq!(limiter.check("c", 1500), Decision::Admit);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn capacity_sweeps_are_spaced_out() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            window_ms: 100,
            max_requests: 5,
            max_tracked_clients: 2,
        })
        .unwrap();

        assert_eq!(limiter.check("a", 0), Decision::Admit);
        assert_eq!(limiter.check("b", 0), Decision::Admit);
        // sweeps at t=50 and finds nothing idle
        assert_eq!(limiter.check("c", 50), Decision::Reject);
        // "a" and "b" are idle by now, but the last forced sweep was too recent
        assert_eq!(limiter.check("c", 200), Decision::Reject);
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.check("c", 1_050), Decision::Admit);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn cap_holds_when_new_clients_race() {
        for _ in 0..50 {
            let limiter = SlidingWindowLimiter::new(RateLimitConfig {
                window_ms: 60_000,
                max_requests: 5,
                max_tracked_clients: 4,
            })
            .unwrap();
            let admitted = AtomicUsize::new(0);

            std::thread::scope(|scope| {
                for i in 0..16 {
                    let limiter = &limiter;
                    let admitted = &admitted;
                    scope.spawn(move || {
                        if limiter.check(&format!("client-{i}"), 0) == Decision::Admit {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            });

            assert_eq!(admitted.load(Ordering::Relaxed), 4);
            assert_eq!(limiter.tracked_clients(), 4);
        }
    }

    #[test]
    fn sweep_frees_slots_for_new_clients() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig {
            window_ms: 1000,
            max_requests: 5,
            max_tracked_clients: 1,
        })
        .unwrap();

        assert_eq!(limiter.check("a", 0), Decision::Admit);
        assert_eq!(limiter.sweep(5_000), 1);
        // no forced sweep needed, the slot was already released
        assert_eq!(limiter.check("b", 5_000), Decision::Admit);
        assert_eq!(limiter.check("c", 5_000), Decision::Reject);
    }

    #[test]
    fn ceiling_holds_under_parallel_checks() {
        let limiter = limiter(60_000, 25);
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        if limiter.check("shared", 1_000) == Decision::Admit {
                            admitted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::Relaxed), 25);
        assert_eq!(limiter.request_count("shared"), 25);
    }
}
