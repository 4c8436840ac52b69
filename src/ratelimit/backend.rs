//! Rate limiter trait for abstracting in-process and store-backed windows.

use std::time::Duration;

use async_trait::async_trait;

use super::client::WindowKey;
use super::policy::RateLimitPolicy;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request was admitted and recorded in the client's window.
    Admitted {
        /// Admissions left in the current window
        remaining: u32,
    },
    /// The client has used its quota for the trailing window.
    Rejected {
        /// How long the client is told to wait
        retry_after: Duration,
    },
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// Trait for rate limiter implementations.
///
/// Lets the gate work with either the in-process `SlidingWindowLimiter` or
/// the `StoreWindowLimiter` without knowing which.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Check and record one request in the window `key` against `policy`.
    async fn check(&self, key: &WindowKey, policy: &RateLimitPolicy) -> Decision;
}
