//! Single-process key-value store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{KeyValueStore, StoreError};
use crate::clock::{Clock, SystemClock};

/// Expired entries are purged inline once every this many writes.
const PURGE_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory [`KeyValueStore`] backed by a `DashMap`.
///
/// Expiry is lazy: reads ignore expired entries, and every
/// `PURGE_EVERY_WRITES` writes the caller that crosses the threshold drops
/// whatever has expired.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            writes: AtomicU64::new(0),
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged = purged, "Purged expired store entries");
        }
        purged
    }

    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = self.clock.now();
        let live = self
            .entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone());

        if live.is_none() {
            self.entries.remove_if(key, |_, stored| !stored.is_live(now));
        }
        Ok(live)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .insert(key.to_string(), StoredValue { value, expires_at });
        self.record_write();
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let swapped = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|stored| stored.is_live(now))
                    .map(|stored| stored.value.as_slice());
                if current != expected {
                    false
                } else {
                    match new {
                        Some(value) => {
                            occupied.insert(StoredValue {
                                value,
                                expires_at: now + ttl,
                            });
                        }
                        None => {
                            occupied.remove();
                        }
                    }
                    true
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    false
                } else {
                    if let Some(value) = new {
                        vacant.insert(StoredValue {
                            value,
                            expires_at: now + ttl,
                        });
                    }
                    true
                }
            }
        };

        if swapped {
            self.record_write();
        }
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _clock) = store_with_clock();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let (store, clock) = store_with_clock();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(9));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_swap_insert_only_when_absent() {
        let (store, _clock) = store_with_clock();
        let ttl = Duration::from_secs(60);

        assert!(store
            .compare_and_swap("k", None, Some(b"first".to_vec()), ttl)
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap("k", None, Some(b"second".to_vec()), ttl)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_swap_replace_and_delete() {
        let (store, _clock) = store_with_clock();
        let ttl = Duration::from_secs(60);
        store.set_with_ttl("k", b"a".to_vec(), ttl).await.unwrap();

        assert!(!store
            .compare_and_swap("k", Some(b"x"), Some(b"b".to_vec()), ttl)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"a"), Some(b"b".to_vec()), ttl)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"b"), None, ttl)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_treats_expired_as_absent() {
        let (store, clock) = store_with_clock();
        store
            .set_with_ttl("k", b"old".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        assert!(store
            .compare_and_swap("k", None, Some(b"new".to_vec()), Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store
            .set_with_ttl("short", b"1".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .set_with_ttl("long", b"2".to_vec(), Duration::from_secs(100))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
