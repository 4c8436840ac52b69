//! Idempotency gate stage.
//!
//! Only POST, PUT and PATCH are considered, and only when the caller sends
//! the idempotency header. Store failures of any kind are treated as a cache
//! miss: the request runs normally, it just is not deduplicated.

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::pipeline::{route_template, Next, Stage};
use super::response::ProblemDetails;
use crate::idempotency::{
    CachedResponseEnvelope, CapturedResponse, Claim, IdempotencyKey, IdempotencyStore, ScopedKey,
};
use crate::ratelimit::ClientIdentifier;

/// Default request header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";

/// Settings for [`IdempotencyStage`].
#[derive(Debug, Clone)]
pub struct IdempotencyOptions {
    /// Header carrying the key
    pub header_name: String,
    /// Add `X-Idempotent-Replayed: true` to replays
    pub mark_replays: bool,
    /// Hold a claim on the key while the first request runs and answer
    /// concurrent duplicates with 409
    pub claim_in_flight: bool,
    /// Bodies larger than this are delivered but not cached
    pub max_cached_body_bytes: usize,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            mark_replays: false,
            claim_in_flight: false,
            max_cached_body_bytes: 1024 * 1024,
        }
    }
}

/// Replays cached responses for repeated idempotency keys.
///
/// Keys are scoped to the caller, as derived by `identifier`, and to the
/// matched route.
#[derive(Debug)]
pub struct IdempotencyStage {
    store: IdempotencyStore,
    identifier: ClientIdentifier,
    options: IdempotencyOptions,
}

impl IdempotencyStage {
    /// Create the stage.
    pub fn new(
        store: IdempotencyStore,
        identifier: ClientIdentifier,
        options: IdempotencyOptions,
    ) -> Self {
        Self {
            store,
            identifier,
            options,
        }
    }

    /// Cached envelope for `key`. Store failures read as a miss.
    async fn lookup(&self, key: &ScopedKey) -> Option<CachedResponseEnvelope> {
        match self.store.get(key).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(
                    idempotency_key = %key,
                    error = %e,
                    "Idempotency store lookup failed, treating as miss"
                );
                None
            }
        }
    }

    fn replay(&self, key: &ScopedKey, envelope: &CachedResponseEnvelope) -> Response {
        info!(
            idempotency_key = %key,
            status = envelope.status_code,
            "Replaying cached idempotent response"
        );
        envelope.to_response(self.options.mark_replays)
    }

    async fn release_claim(&self, key: &ScopedKey, claim: &Claim) {
        if let Err(e) = self.store.release(key, claim).await {
            warn!(idempotency_key = %key, error = %e, "Failed to release idempotency claim");
        }
    }

    async fn take_claim(&self, key: &ScopedKey) -> Result<Option<Claim>, Response> {
        if !self.options.claim_in_flight {
            return Ok(None);
        }
        match self.store.claim(key).await {
            Ok(Some(claim)) => Ok(Some(claim)),
            Ok(None) => {
                warn!(idempotency_key = %key, "Concurrent request for in-flight idempotency key");
                Err(ProblemDetails::request_in_progress(key.key()).into_response())
            }
            Err(e) => {
                warn!(
                    idempotency_key = %key,
                    error = %e,
                    "Idempotency claim failed, continuing without claim"
                );
                Ok(None)
            }
        }
    }

    async fn store_response(&self, key: &ScopedKey, captured: &CapturedResponse) {
        if !captured.is_success() {
            debug!(
                idempotency_key = %key,
                status = captured.status().as_u16(),
                "Not caching unsuccessful response"
            );
            return;
        }
        if captured.body_len() > self.options.max_cached_body_bytes {
            warn!(
                idempotency_key = %key,
                body_len = captured.body_len(),
                limit = self.options.max_cached_body_bytes,
                "Response too large to cache"
            );
            return;
        }

        let envelope = captured.to_envelope(Utc::now());
        if let Err(e) = self.store.put(key, &envelope).await {
            warn!(
                idempotency_key = %key,
                error = %e,
                "Failed to cache idempotent response"
            );
        }
    }
}

#[async_trait]
impl Stage for IdempotencyStage {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        if !matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH) {
            return next.run(req).await;
        }

        let Some(raw) = req.headers().get(self.options.header_name.as_str()) else {
            return next.run(req).await;
        };

        let parsed = raw
            .to_str()
            .map_err(|e| e.to_string())
            .and_then(|value| IdempotencyKey::parse(value).map_err(|e| e.to_string()));
        let key = match parsed {
            Ok(key) => key,
            Err(reason) => {
                warn!(
                    method = %req.method(),
                    path = %req.uri().path(),
                    reason = %reason,
                    "Malformed idempotency key"
                );
                return ProblemDetails::invalid_idempotency_key(&self.options.header_name, reason)
                    .into_response();
            }
        };
        let client = self.identifier.identify(&req);
        let key = ScopedKey::new(key, &client, req.method(), &route_template(&req));

        if let Some(envelope) = self.lookup(&key).await {
            return self.replay(&key, &envelope);
        }

        let claim = match self.take_claim(&key).await {
            Ok(claim) => claim,
            Err(conflict) => return conflict,
        };

        // The previous holder may have cached its response and released the
        // claim between the lookup above and taking the claim.
        if let Some(claim) = &claim {
            if let Some(envelope) = self.lookup(&key).await {
                self.release_claim(&key, claim).await;
                return self.replay(&key, &envelope);
            }
        }

        let response = next.run(req).await;

        // A cancelled request is dropped before reaching this point, so it
        // never writes to the store.
        let delivered = match CapturedResponse::capture(response).await {
            Ok(captured) => {
                self.store_response(&key, &captured).await;
                captured.into_response()
            }
            Err(e) => {
                error!(
                    idempotency_key = %key,
                    error = %e,
                    "Failed to buffer downstream response"
                );
                ProblemDetails::response_unavailable().into_response()
            }
        };

        if let Some(claim) = claim {
            self.release_claim(&key, &claim).await;
        }

        delivered
    }
}
