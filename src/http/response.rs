//! Responses the gate produces on its own.

use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitPolicy;

/// Body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceeded {
    pub error: String,
    pub message: String,
    pub retry_after: u32,
}

impl RateLimitExceeded {
    /// Body for a client that exhausted `policy`.
    pub fn for_policy(policy: &RateLimitPolicy) -> Self {
        Self {
            error: "Rate limit exceeded".to_string(),
            message: format!(
                "Too many requests. Limit is {} per {} seconds; retry after {} seconds.",
                policy.max_requests, policy.window_seconds, policy.window_seconds
            ),
            retry_after: policy.window_seconds,
        }
    }
}

impl IntoResponse for RateLimitExceeded {
    fn into_response(self) -> Response {
        let retry_after = HeaderValue::from(self.retry_after);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(self)).into_response();
        response.headers_mut().insert(RETRY_AFTER, retry_after);
        response
    }
}

/// RFC 7807 problem details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
}

impl ProblemDetails {
    /// 400 for an `X-Idempotency-Key` value that is not a UUID.
    pub fn invalid_idempotency_key(header: &str, detail: impl std::fmt::Display) -> Self {
        Self {
            kind: "https://tools.ietf.org/html/rfc9110#section-15.5.1".to_string(),
            title: "Invalid idempotency key".to_string(),
            status: StatusCode::BAD_REQUEST.as_u16(),
            detail: format!("The {} header must be a UUID: {}", header, detail),
        }
    }

    /// 409 for a key whose first request is still being processed.
    pub fn request_in_progress(key: impl std::fmt::Display) -> Self {
        Self {
            kind: "https://tools.ietf.org/html/rfc9110#section-15.5.10".to_string(),
            title: "Request in progress".to_string(),
            status: StatusCode::CONFLICT.as_u16(),
            detail: format!(
                "A request with idempotency key {} is still being processed; retry once it completes.",
                key
            ),
        }
    }

    /// 500 for a downstream response whose body could not be read.
    pub fn response_unavailable() -> Self {
        Self {
            kind: "https://tools.ietf.org/html/rfc9110#section-15.6.1".to_string(),
            title: "Response unavailable".to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: "The response body could not be read.".to_string(),
        }
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(self)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
