//! Per-client sliding window rate limiting.

mod backend;
mod client;
mod limiter;
mod policy;
mod reaper;
mod shared;
mod window;

pub use backend::{Decision, RateLimiterBackend};
pub use client::{AuthenticatedUser, ClientIdentifier, ClientKey, WindowKey};
pub use limiter::{SlidingWindowLimiter, DEFAULT_CLEANUP_INTERVAL, DEFAULT_STALE_AFTER};
pub use policy::{PolicyFile, PolicyTable, RateLimitPolicy, RoutePolicy};
pub use reaper::StaleEntryReaper;
pub use shared::{StoreWindowLimiter, DEFAULT_MAX_RETRIES};
pub use window::ClientWindow;
