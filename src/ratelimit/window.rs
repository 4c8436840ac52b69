//! Per-client sliding window state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::backend::Decision;
use super::policy::RateLimitPolicy;

/// Timestamp log of one client's admitted requests.
///
/// The log sits behind the client's own lock. The last access time lives in
/// an atomic next to it so the reaper can judge staleness without taking
/// that lock.
#[derive(Debug)]
pub struct ClientWindow {
    /// Admission instants, oldest first
    timestamps: Mutex<VecDeque<Instant>>,
    /// Last access, in milliseconds since the owning limiter's epoch
    last_access_ms: AtomicU64,
}

impl ClientWindow {
    /// Create an empty window last touched at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    /// Prune the log, then admit and record `now` if the client still has
    /// quota under `policy`.
    pub fn try_admit(&self, now: Instant, now_ms: u64, policy: &RateLimitPolicy) -> Decision {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);

        let mut timestamps = self.timestamps.lock();
        prune(&mut timestamps, now, policy.window());

        let used = timestamps.len();
        if used >= policy.max_requests as usize {
            return Decision::Rejected {
                retry_after: policy.window(),
            };
        }

        timestamps.push_back(now);
        Decision::Admitted {
            remaining: policy.max_requests - (used as u32 + 1),
        }
    }

    /// Number of timestamps younger than `window` at `now`.
    pub fn count(&self, now: Instant, window: Duration) -> usize {
        let mut timestamps = self.timestamps.lock();
        prune(&mut timestamps, now, window);
        timestamps.len()
    }

    /// Last access in milliseconds since the limiter's epoch.
    pub fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    /// Whether the client has been idle for at least `stale_after_ms`.
    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_access_ms()) >= stale_after_ms
    }
}

/// Drop every timestamp at least `window` old.
///
/// A timestamp exactly `window` old is expired: the window is exclusive of
/// its far edge.
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: u32, secs: u32) -> RateLimitPolicy {
        RateLimitPolicy::new(max, secs).unwrap()
    }

    #[test]
    fn test_admit_within_limit() {
        let window = ClientWindow::new(0);
        let now = Instant::now();

        assert_eq!(
            window.try_admit(now, 0, &policy(3, 60)),
            Decision::Admitted { remaining: 2 }
        );
        assert_eq!(window.count(now, Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_reject_when_full() {
        let window = ClientWindow::new(0);
        let now = Instant::now();
        let p = policy(2, 60);

        assert!(window.try_admit(now, 0, &p).is_admitted());
        assert!(window.try_admit(now, 0, &p).is_admitted());
        assert_eq!(
            window.try_admit(now, 0, &p),
            Decision::Rejected {
                retry_after: Duration::from_secs(60)
            }
        );
        // Rejections are not recorded
        assert_eq!(window.count(now, p.window()), 2);
    }

    #[test]
    fn test_timestamp_exactly_window_old_is_expired() {
        let window = ClientWindow::new(0);
        let start = Instant::now();
        let p = policy(1, 60);

        assert!(window.try_admit(start, 0, &p).is_admitted());

        let just_inside = start + Duration::from_secs(60) - Duration::from_millis(1);
        assert!(!window.try_admit(just_inside, 59_999, &p).is_admitted());

        let at_edge = start + Duration::from_secs(60);
        assert!(window.try_admit(at_edge, 60_000, &p).is_admitted());
    }

    #[test]
    fn test_staleness_tracks_last_access() {
        let window = ClientWindow::new(1_000);
        assert!(!window.is_stale(1_500, 1_000));
        assert!(window.is_stale(2_000, 1_000));

        window.try_admit(Instant::now(), 5_000, &policy(10, 1));
        assert_eq!(window.last_access_ms(), 5_000);
        assert!(!window.is_stale(5_500, 1_000));
    }
}
