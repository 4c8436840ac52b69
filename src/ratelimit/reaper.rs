//! Inline eviction of idle client windows.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::window::ClientWindow;

/// Self-throttled sweep over the limiter's client map.
///
/// There is no background task. Request handling calls [`maybe_sweep`]
/// and at most one caller per cleanup interval actually sweeps: a relaxed
/// load of the last sweep time filters out almost every call, and the sweep
/// lock plus a second check settle the race between the few that get past.
///
/// The sweep may remove a client whose admission is in flight. That
/// admission lands in the detached window and the client's next request
/// starts a fresh one, so its quota resets slightly early. Preventing this
/// would mean holding the map and the client lock together.
///
/// [`maybe_sweep`]: StaleEntryReaper::maybe_sweep
#[derive(Debug)]
pub struct StaleEntryReaper {
    cleanup_interval_ms: u64,
    stale_after_ms: u64,
    /// Last sweep, in milliseconds since the limiter's epoch
    last_sweep_ms: AtomicU64,
    sweep_lock: Mutex<()>,
}

impl StaleEntryReaper {
    /// Create a reaper. `stale_after` should exceed `cleanup_interval`;
    /// configuration validation enforces this.
    pub fn new(cleanup_interval: Duration, stale_after: Duration) -> Self {
        Self {
            cleanup_interval_ms: cleanup_interval.as_millis() as u64,
            stale_after_ms: stale_after.as_millis() as u64,
            last_sweep_ms: AtomicU64::new(0),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Sweep `clients` if a cleanup interval has passed since the last sweep.
    ///
    /// Returns the number of evicted windows when this call swept.
    pub fn maybe_sweep<K>(&self, now_ms: u64, clients: &DashMap<K, Arc<ClientWindow>>) -> Option<usize>
    where
        K: Eq + Hash,
    {
        if !self.is_due(now_ms) {
            return None;
        }

        // Whoever holds the lock is already sweeping.
        let _guard = self.sweep_lock.try_lock()?;
        if !self.is_due(now_ms) {
            return None;
        }
        self.last_sweep_ms.store(now_ms, Ordering::Relaxed);

        let before = clients.len();
        clients.retain(|_, window| !window.is_stale(now_ms, self.stale_after_ms));
        let evicted = before.saturating_sub(clients.len());

        debug!(
            evicted = evicted,
            remaining = clients.len(),
            "Swept stale client windows"
        );
        Some(evicted)
    }

    fn is_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sweep_ms.load(Ordering::Relaxed))
            >= self.cleanup_interval_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ClientKey;

    fn clients_with(entries: &[(&str, u64)]) -> DashMap<ClientKey, Arc<ClientWindow>> {
        let clients = DashMap::new();
        for (id, last_access) in entries {
            clients.insert(
                ClientKey::User(id.to_string()),
                Arc::new(ClientWindow::new(*last_access)),
            );
        }
        clients
    }

    #[test]
    fn test_no_sweep_before_interval() {
        let reaper = StaleEntryReaper::new(Duration::from_secs(60), Duration::from_secs(300));
        let clients = clients_with(&[("a", 0)]);

        assert_eq!(reaper.maybe_sweep(59_999, &clients), None);
        assert_eq!(clients.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_only_stale_clients() {
        let reaper = StaleEntryReaper::new(Duration::from_secs(60), Duration::from_secs(300));
        let clients = clients_with(&[("idle", 0), ("active", 250_000)]);

        assert_eq!(reaper.maybe_sweep(300_000, &clients), Some(1));
        assert!(clients.contains_key(&ClientKey::User("active".into())));
        assert!(!clients.contains_key(&ClientKey::User("idle".into())));
    }

    #[test]
    fn test_sweep_runs_once_per_interval() {
        let reaper = StaleEntryReaper::new(Duration::from_secs(60), Duration::from_secs(300));
        let clients = clients_with(&[]);

        assert_eq!(reaper.maybe_sweep(60_000, &clients), Some(0));
        assert_eq!(reaper.maybe_sweep(60_001, &clients), None);
        assert_eq!(reaper.maybe_sweep(119_999, &clients), None);
        assert_eq!(reaper.maybe_sweep(120_000, &clients), Some(0));
    }

    #[test]
    fn test_concurrent_callers_sweep_once() {
        let reaper = Arc::new(StaleEntryReaper::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let clients = Arc::new(clients_with(&[("idle", 0)]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reaper = reaper.clone();
                let clients = clients.clone();
                std::thread::spawn(move || reaper.maybe_sweep(400_000, &clients).is_some())
            })
            .collect();

        let sweeps = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|swept| *swept)
            .count();
        assert_eq!(sweeps, 1);
        assert!(clients.is_empty());
    }
}
