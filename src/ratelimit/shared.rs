//! Rate limiter whose client windows live in a [`KeyValueStore`].
//!
//! Lets several gate instances share one view of each client's window on
//! each route. Each check is a read-modify-write of that window's timestamp
//! log, committed with compare-and-swap and retried on contention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{Decision, RateLimiterBackend};
use super::client::WindowKey;
use super::policy::RateLimitPolicy;
use crate::clock::{Clock, SystemClock};
use crate::store::{KeyValueStore, StoreError};

/// Prefix for window keys in the store.
const KEY_PREFIX: &str = "ratelimit:";
/// Default number of compare-and-swap attempts per check.
pub const DEFAULT_MAX_RETRIES: u32 = 8;

/// A rate limiter backed by a shared key-value store.
///
/// Store failures and exhausted retries admit the request: losing the
/// limiter's store must not take the API down with it.
pub struct StoreWindowLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl StoreWindowLimiter {
    /// Create a limiter over `store` using the system clock.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock::new()), DEFAULT_MAX_RETRIES)
    }

    /// Create a limiter with an explicit clock and retry budget.
    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, max_retries: u32) -> Self {
        Self {
            store,
            clock,
            max_retries: max_retries.max(1),
        }
    }

    /// Check one request in the window `window` against `policy`.
    pub async fn check_rate_limit(&self, window: &WindowKey, policy: &RateLimitPolicy) -> Decision {
        let key = storage_key(window);

        match self.try_check(&key, policy).await {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                warn!(
                    window = %window,
                    attempts = self.max_retries,
                    "Rate limit window contended past retry budget, admitting request"
                );
                Decision::Admitted { remaining: 0 }
            }
            Err(e) => {
                warn!(
                    window = %window,
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                Decision::Admitted { remaining: 0 }
            }
        }
    }

    /// Returns `Ok(None)` when every attempt lost its compare-and-swap.
    async fn try_check(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<Decision>, StoreError> {
        let window_ms = u64::from(policy.window_seconds) * 1000;

        for attempt in 1..=self.max_retries {
            let now_ms = self.clock.unix_millis();
            let current = self.store.get(key).await?;
            let mut timestamps = match &current {
                Some(raw) => decode(key, raw)?,
                None => Vec::new(),
            };

            // Same exclusive edge as the in-process window.
            timestamps.retain(|t| now_ms.saturating_sub(*t) < window_ms);

            let used = timestamps.len();
            if used >= policy.max_requests as usize {
                debug!(key = %key, used = used, "Shared rate limit exceeded");
                return Ok(Some(Decision::Rejected {
                    retry_after: policy.window(),
                }));
            }

            timestamps.push(now_ms);
            let encoded = encode(key, &timestamps)?;
            let swapped = self
                .store
                .compare_and_swap(key, current.as_deref(), Some(encoded), policy.window())
                .await?;

            if swapped {
                return Ok(Some(Decision::Admitted {
                    remaining: policy.max_requests - (used as u32 + 1),
                }));
            }
            trace!(key = %key, attempt = attempt, "Lost window update race, retrying");
        }

        Ok(None)
    }
}

impl std::fmt::Debug for StoreWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreWindowLimiter")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiterBackend for StoreWindowLimiter {
    async fn check(&self, key: &WindowKey, policy: &RateLimitPolicy) -> Decision {
        self.check_rate_limit(key, policy).await
    }
}

fn storage_key(window: &WindowKey) -> String {
    format!("{}{}", KEY_PREFIX, window)
}

fn decode(key: &str, raw: &[u8]) -> Result<Vec<u64>, StoreError> {
    serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode(key: &str, timestamps: &[u64]) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(timestamps).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::ClientKey;
    use crate::store::MemoryStore;
    use axum::http::Method;

    struct UnavailableStore;

    #[async_trait]
    impl KeyValueStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn set_with_ttl(&self, _: &str, _: Vec<u8>, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn compare_and_swap(
            &self,
            _: &str,
            _: Option<&[u8]>,
            _: Option<Vec<u8>>,
            _: Duration,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn reviews(client: ClientKey) -> WindowKey {
        WindowKey::new(client, Method::POST, "/reviews")
    }

    fn shared_limiter() -> (StoreWindowLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let limiter = StoreWindowLimiter::with_clock(store.clone(), Arc::new(clock.clone()), 4);
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_shared_limit_enforced() {
        let (limiter, _store, _clock) = shared_limiter();
        let client = reviews(ClientKey::Ip("10.1.1.1".parse().unwrap()));
        let policy = RateLimitPolicy::new(3, 60).unwrap();

        for i in 1..=3 {
            let decision = limiter.check_rate_limit(&client, &policy).await;
            assert!(decision.is_admitted(), "request {} should be admitted", i);
        }
        assert!(!limiter.check_rate_limit(&client, &policy).await.is_admitted());
    }

    #[tokio::test]
    async fn test_two_instances_share_a_window() {
        let (first, store, clock) = shared_limiter();
        let second = StoreWindowLimiter::with_clock(store, Arc::new(clock), 4);
        let client = reviews(ClientKey::User("u1".into()));
        let policy = RateLimitPolicy::new(2, 60).unwrap();

        assert!(first.check_rate_limit(&client, &policy).await.is_admitted());
        assert!(second.check_rate_limit(&client, &policy).await.is_admitted());
        assert!(!first.check_rate_limit(&client, &policy).await.is_admitted());
    }

    #[tokio::test]
    async fn test_window_expires_in_store() {
        let (limiter, _store, clock) = shared_limiter();
        let client = reviews(ClientKey::Session("s".into()));
        let policy = RateLimitPolicy::new(1, 10).unwrap();

        assert!(limiter.check_rate_limit(&client, &policy).await.is_admitted());
        assert!(!limiter.check_rate_limit(&client, &policy).await.is_admitted());
        clock.advance(Duration::from_secs(10));
        assert!(limiter.check_rate_limit(&client, &policy).await.is_admitted());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_open() {
        let limiter = StoreWindowLimiter::new(Arc::new(UnavailableStore));
        let client = reviews(ClientKey::Anonymous);
        let policy = RateLimitPolicy::new(1, 60).unwrap();

        for _ in 0..5 {
            assert!(limiter.check_rate_limit(&client, &policy).await.is_admitted());
        }
    }

    #[tokio::test]
    async fn test_corrupt_window_fails_open() {
        let (limiter, store, _clock) = shared_limiter();
        let client = reviews(ClientKey::User("u".into()));
        store
            .set_with_ttl(&storage_key(&client), b"not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        let policy = RateLimitPolicy::new(1, 60).unwrap();
        assert!(limiter.check_rate_limit(&client, &policy).await.is_admitted());
    }

    #[tokio::test]
    async fn test_routes_keep_separate_windows() {
        let (limiter, store, clock) = shared_limiter();
        let client = ClientKey::User("u".into());
        let reviews_key = reviews(client.clone());
        let orgs_key = WindowKey::new(client, Method::POST, "/organizations");
        let reviews_policy = RateLimitPolicy::new(5, 60).unwrap();
        let orgs_policy = RateLimitPolicy::new(100, 10).unwrap();

        for _ in 0..5 {
            assert!(limiter.check_rate_limit(&reviews_key, &reviews_policy).await.is_admitted());
        }
        clock.set_elapsed(Duration::from_secs(11));
        assert!(limiter.check_rate_limit(&orgs_key, &orgs_policy).await.is_admitted());

        clock.set_elapsed(Duration::from_secs(12));
        for _ in 0..5 {
            assert!(!limiter.check_rate_limit(&reviews_key, &reviews_policy).await.is_admitted());
        }

        // The reviews log keeps its own 60 second TTL.
        clock.set_elapsed(Duration::from_secs(59));
        assert!(store.get(&storage_key(&reviews_key)).await.unwrap().is_some());
        assert!(store.get(&storage_key(&orgs_key)).await.unwrap().is_none());
    }
}
