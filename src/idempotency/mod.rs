//! Idempotency-key deduplication of retried writes.
//!
//! A successful (2xx) response to a write carrying an idempotency key is
//! cached for 24 hours and replayed verbatim for later requests with the
//! same key. Failures are never cached, so a retry after a failure runs the
//! handler again.

mod capture;
mod envelope;
mod key;
mod store;

pub use capture::CapturedResponse;
pub use envelope::{CachedResponseEnvelope, REPLAYED_HEADER};
pub use key::{IdempotencyKey, ScopedKey};
pub use store::{Claim, IdempotencyStore, DEFAULT_CLAIM_TTL, DEFAULT_TTL};
