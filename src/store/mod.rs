//! Key-value capability shared by the idempotency cache and the
//! store-backed limiter.
//!
//! Gate logic only ever talks to [`KeyValueStore`], so the in-process
//! [`MemoryStore`] and an external cache are interchangeable.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Errors reported by a key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be decoded.
    #[error("corrupt value under {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Abstract key-value store with per-entry expiry.
///
/// Every operation is individually atomic; nothing spans more than one key.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the live value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Unconditionally write `value` under `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration)
        -> Result<(), StoreError>;

    /// Replace the value under `key` only if it currently equals `expected`.
    ///
    /// `expected: None` means "no live value". `new: None` deletes the key.
    /// Returns `true` when the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Vec<u8>>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
