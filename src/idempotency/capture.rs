//! Buffering of downstream responses.

use axum::body::{Body, Bytes};
use axum::http::response::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};

use super::envelope::CachedResponseEnvelope;

/// A downstream response whose body has been read fully into memory.
///
/// The same bytes are handed back to the caller and, for 2xx responses,
/// written to the idempotency store.
#[derive(Debug)]
pub struct CapturedResponse {
    parts: Parts,
    body: Bytes,
}

impl CapturedResponse {
    /// Drain `response`'s body into a buffer.
    ///
    /// Fails only if the downstream body stream itself errors.
    pub async fn capture(response: Response) -> Result<Self, axum::Error> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;
        Ok(Self { parts, body })
    }

    /// Final status of the downstream response.
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Whether the response may be cached.
    pub fn is_success(&self) -> bool {
        self.parts.status.is_success()
    }

    /// Buffered body length in bytes.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Snapshot the response for the store.
    pub fn to_envelope(&self, created_at: DateTime<Utc>) -> CachedResponseEnvelope {
        CachedResponseEnvelope::from_parts(&self.parts, &self.body, created_at)
    }

    /// Hand the buffered response back for delivery.
    pub fn into_response(self) -> Response {
        Response::from_parts(self.parts, Body::from(self.body))
    }
}
