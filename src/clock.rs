//! Time source used by the limiter and the in-memory store.
//!
//! Everything that reads "now" goes through [`Clock`] so tests can drive time
//! explicitly with [`ManualClock`] instead of sleeping.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Port for reading the current time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used for in-process windows and expiry.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for state that
    /// is shared with other processes through a store.
    fn unix_millis(&self) -> u64;
}

/// System clock backed by `Instant::now()` and `chrono::Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually advanced clock.
///
/// Clones share the same underlying offset, so a clone handed to the limiter
/// moves forward when the test advances its own copy.
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    base_unix_millis: u64,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            base_unix_millis: SystemClock.unix_millis(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Move the clock to `at` past its starting point.
    pub fn set_elapsed(&self, at: Duration) {
        *self.offset.lock() = at;
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }

    fn unix_millis(&self) -> u64 {
        self.base_unix_millis + self.offset.lock().as_millis() as u64
    }
}
