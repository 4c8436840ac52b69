//! In-process sliding window rate limiter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{Decision, RateLimiterBackend};
use super::client::WindowKey;
use super::policy::RateLimitPolicy;
use super::reaper::StaleEntryReaper;
use super::window::ClientWindow;
use crate::clock::{Clock, SystemClock};

/// Default interval between reaper sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Default idle time after which a client's window is evicted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

/// Sliding window limiter holding one timestamp log per client and route.
///
/// This struct is thread-safe and can be shared across tasks. Each check
/// locks only the calling client's window; the map itself is only touched
/// for the atomic get-or-create of that window.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    /// Windows indexed by client and route
    clients: DashMap<WindowKey, Arc<ClientWindow>>,
    reaper: StaleEntryReaper,
    clock: Arc<dyn Clock>,
    /// Origin for the millisecond offsets used by windows and the reaper
    epoch: Instant,
}

impl SlidingWindowLimiter {
    /// Create a limiter with default reaper settings and the system clock.
    pub fn new() -> Self {
        Self::with_settings(
            Arc::new(SystemClock::new()),
            DEFAULT_CLEANUP_INTERVAL,
            DEFAULT_STALE_AFTER,
        )
    }

    /// Create a limiter with an explicit clock and reaper settings.
    pub fn with_settings(
        clock: Arc<dyn Clock>,
        cleanup_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        let epoch = clock.now();
        Self {
            clients: DashMap::new(),
            reaper: StaleEntryReaper::new(cleanup_interval, stale_after),
            clock,
            epoch,
        }
    }

    /// Check one request in the window `key` against `policy`, recording it
    /// if admitted.
    pub fn check_rate_limit(&self, key: &WindowKey, policy: &RateLimitPolicy) -> Decision {
        let now = self.clock.now();
        let now_ms = self.offset_ms(now);

        self.reaper.maybe_sweep(now_ms, &self.clients);

        // Clone the window out so the map shard is unlocked before the
        // client lock is taken.
        let window = self
            .clients
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(window = %key, "Creating client window");
                Arc::new(ClientWindow::new(now_ms))
            })
            .clone();

        let decision = window.try_admit(now, now_ms, policy);

        trace!(
            window = %key,
            max_requests = policy.max_requests,
            window_seconds = policy.window_seconds,
            decision = ?decision,
            "Checked rate limit"
        );
        decision
    }

    /// Number of requests recorded under `key` still inside `window`.
    ///
    /// Returns `None` if the limiter holds no window for the key.
    pub fn request_count(&self, key: &WindowKey, window: Duration) -> Option<usize> {
        let now = self.clock.now();
        let entry = self.clients.get(key)?.clone();
        Some(entry.count(now, window))
    }

    /// Number of tracked (client, route) windows.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Forget every client.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.clients.clear();
    }

    fn offset_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for SlidingWindowLimiter {
    async fn check(&self, key: &WindowKey, policy: &RateLimitPolicy) -> Decision {
        self.check_rate_limit(key, policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::ClientKey;
    use axum::http::Method;

    fn limiter() -> (SlidingWindowLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = SlidingWindowLimiter::with_settings(
            Arc::new(clock.clone()),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );
        (limiter, clock)
    }

    fn user(id: &str) -> WindowKey {
        on_route(id, "/reviews")
    }

    fn on_route(id: &str, route: &str) -> WindowKey {
        WindowKey::new(ClientKey::User(id.to_string()), Method::POST, route)
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = SlidingWindowLimiter::new();
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_check_creates_window() {
        let (limiter, _clock) = limiter();
        let policy = RateLimitPolicy::new(5, 60).unwrap();

        assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.request_count(&user("a"), policy.window()), Some(1));
    }

    #[test]
    fn test_n_plus_one_rejected() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::new(5, 60).unwrap();

        for i in 0..5 {
            clock.set_elapsed(Duration::from_secs(i * 2));
            let decision = limiter.check_rate_limit(&user("a"), &policy);
            assert!(decision.is_admitted(), "request {} should be admitted", i + 1);
        }

        clock.set_elapsed(Duration::from_secs(11));
        assert_eq!(
            limiter.check_rate_limit(&user("a"), &policy),
            Decision::Rejected {
                retry_after: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_window_slides_instead_of_resetting() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::new(2, 10).unwrap();

        clock.set_elapsed(Duration::from_secs(0));
        assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        clock.set_elapsed(Duration::from_secs(6));
        assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());

        // The first admission has left the window, the second has not.
        clock.set_elapsed(Duration::from_secs(10));
        assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        clock.set_elapsed(Duration::from_secs(12));
        assert!(!limiter.check_rate_limit(&user("a"), &policy).is_admitted());
    }

    #[test]
    fn test_idle_client_gets_full_quota_back() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::new(3, 30).unwrap();

        for _ in 0..3 {
            assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        }
        assert!(!limiter.check_rate_limit(&user("a"), &policy).is_admitted());

        clock.advance(Duration::from_secs(30));
        for _ in 0..3 {
            assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        }
    }

    #[test]
    fn test_clients_have_separate_windows() {
        let (limiter, _clock) = limiter();
        let policy = RateLimitPolicy::new(1, 60).unwrap();

        assert!(limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        assert!(limiter.check_rate_limit(&user("b"), &policy).is_admitted());
        assert!(!limiter.check_rate_limit(&user("a"), &policy).is_admitted());
        assert_eq!(limiter.request_count(&user("b"), policy.window()), Some(1));
    }

    #[test]
    fn test_routes_keep_separate_windows() {
        let (limiter, clock) = limiter();
        let reviews = RateLimitPolicy::new(5, 60).unwrap();
        let organizations = RateLimitPolicy::new(100, 10).unwrap();

        for _ in 0..5 {
            assert!(limiter.check_rate_limit(&on_route("a", "/reviews"), &reviews).is_admitted());
        }

        // A short-window route must not prune the long window's history.
        clock.set_elapsed(Duration::from_secs(11));
        assert!(limiter
            .check_rate_limit(&on_route("a", "/organizations"), &organizations)
            .is_admitted());

        clock.set_elapsed(Duration::from_secs(12));
        let admitted = (0..5)
            .filter(|_| limiter.check_rate_limit(&on_route("a", "/reviews"), &reviews).is_admitted())
            .count();
        assert_eq!(admitted, 0);
        assert_eq!(limiter.request_count(&on_route("a", "/reviews"), reviews.window()), Some(5));
        assert_eq!(limiter.client_count(), 2);
    }

    #[test]
    fn test_reaper_evicts_idle_clients_only() {
        let (limiter, clock) = limiter();
        let policy = RateLimitPolicy::new(10, 60).unwrap();

        limiter.check_rate_limit(&user("idle"), &policy);

        // This sweep is due but "idle" is not yet stale.
        clock.set_elapsed(Duration::from_secs(250));
        limiter.check_rate_limit(&user("active"), &policy);
        assert_eq!(limiter.client_count(), 2);

        clock.set_elapsed(Duration::from_secs(280));
        limiter.check_rate_limit(&user("active"), &policy);

        // Next due sweep happens after "idle" crossed the stale threshold.
        clock.set_elapsed(Duration::from_secs(315));
        limiter.check_rate_limit(&user("active"), &policy);

        assert_eq!(limiter.client_count(), 1);
        assert_eq!(limiter.request_count(&user("idle"), policy.window()), None);
        assert_eq!(limiter.request_count(&user("active"), policy.window()), Some(2));
    }

    #[test]
    fn test_clear() {
        let (limiter, _clock) = limiter();
        let policy = RateLimitPolicy::new(1, 1).unwrap();
        limiter.check_rate_limit(&user("a"), &policy);
        limiter.clear();
        assert_eq!(limiter.client_count(), 0);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(limiter().0);
        let policy = RateLimitPolicy::new(50, 60).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_rate_limit(&user("shared"), &policy).is_admitted())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let (limiter, _clock) = limiter();
        let backend: &dyn RateLimiterBackend = &limiter;
        let policy = RateLimitPolicy::new(1, 60).unwrap();

        assert!(backend.check(&user("a"), &policy).await.is_admitted());
        assert!(!backend.check(&user("a"), &policy).await.is_admitted());
    }
}
