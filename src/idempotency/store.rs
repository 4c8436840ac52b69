//! Idempotency cache over the key-value capability.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::envelope::CachedResponseEnvelope;
use super::key::ScopedKey;
use crate::store::{KeyValueStore, StoreError};

/// Default lifetime of a cached response.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default lifetime of an in-flight claim.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);

const KEY_PREFIX: &str = "idempotency:";
const CLAIM_PREFIX: &str = "idempotency:claim:";

/// Proof that this request holds the in-flight claim on a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    token: Vec<u8>,
}

/// Key → envelope cache with a fixed TTL.
#[derive(Clone)]
pub struct IdempotencyStore {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    claim_ttl: Duration,
}

impl IdempotencyStore {
    /// Create a store with the default 24 hour TTL.
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_ttl(kv, DEFAULT_TTL, DEFAULT_CLAIM_TTL)
    }

    /// Create a store with explicit TTLs.
    pub fn with_ttl(kv: Arc<dyn KeyValueStore>, ttl: Duration, claim_ttl: Duration) -> Self {
        Self { kv, ttl, claim_ttl }
    }

    /// TTL applied to cached responses.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up the response cached under `key`.
    pub async fn get(
        &self,
        key: &ScopedKey,
    ) -> Result<Option<CachedResponseEnvelope>, StoreError> {
        let storage_key = response_key(key);
        let Some(raw) = self.kv.get(&storage_key).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: storage_key,
                reason: e.to_string(),
            })
    }

    /// Cache `envelope` under `key` unless a response is already cached.
    ///
    /// Returns `false` when an earlier write won; the earlier envelope is
    /// left untouched.
    pub async fn put(
        &self,
        key: &ScopedKey,
        envelope: &CachedResponseEnvelope,
    ) -> Result<bool, StoreError> {
        let storage_key = response_key(key);
        let encoded = serde_json::to_vec(envelope).map_err(|e| StoreError::Corrupt {
            key: storage_key.clone(),
            reason: e.to_string(),
        })?;

        let written = self
            .kv
            .compare_and_swap(&storage_key, None, Some(encoded), self.ttl)
            .await?;
        if !written {
            debug!(idempotency_key = %key, "Response already cached, keeping first write");
        }
        Ok(written)
    }

    /// Try to take the in-flight claim on `key`.
    ///
    /// Returns `None` when another request holds it.
    pub async fn claim(&self, key: &ScopedKey) -> Result<Option<Claim>, StoreError> {
        let token = Uuid::new_v4().as_bytes().to_vec();
        let won = self
            .kv
            .compare_and_swap(&claim_key(key), None, Some(token.clone()), self.claim_ttl)
            .await?;
        Ok(won.then_some(Claim { token }))
    }

    /// Give up a claim taken with [`claim`](Self::claim).
    ///
    /// A claim that already expired, or was taken over after expiring, is
    /// left alone.
    pub async fn release(&self, key: &ScopedKey, claim: &Claim) -> Result<(), StoreError> {
        self.kv
            .compare_and_swap(&claim_key(key), Some(&claim.token), None, self.claim_ttl)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore")
            .field("ttl", &self.ttl)
            .field("claim_ttl", &self.claim_ttl)
            .finish_non_exhaustive()
    }
}

fn response_key(key: &ScopedKey) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

fn claim_key(key: &ScopedKey) -> String {
    format!("{}{}", CLAIM_PREFIX, key)
}
