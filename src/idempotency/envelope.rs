//! Stored form of a successful response.

use std::collections::BTreeMap;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::response::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header added to replays when replay marking is enabled.
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

/// A cached response, written once and replayed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponseEnvelope {
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Response headers other than content type and framing headers, as
    /// raw bytes. A repeated header keeps one entry per value, in order.
    pub headers: BTreeMap<String, Vec<Vec<u8>>>,
    pub created_at: DateTime<Utc>,
}

impl CachedResponseEnvelope {
    /// Build an envelope from response head and buffered body.
    pub fn from_parts(parts: &Parts, body: &[u8], created_at: DateTime<Utc>) -> Self {
        let mut content_type = String::new();
        let mut headers: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        for (name, value) in parts.headers.iter() {
            if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            if name == CONTENT_TYPE && content_type.is_empty() {
                // Opaque content types are kept as raw header bytes instead.
                if let Ok(text) = value.to_str() {
                    content_type = text.to_string();
                    continue;
                }
            }
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.as_bytes().to_vec());
        }

        Self {
            status_code: parts.status.as_u16(),
            content_type,
            body: body.to_vec(),
            headers,
            created_at,
        }
    }

    /// Rebuild the response. `mark_replay` adds [`REPLAYED_HEADER`].
    pub fn to_response(&self, mark_replay: bool) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = response.headers_mut();
        if !self.content_type.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_bytes(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        if mark_replay {
            headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
        }
        response
    }
}
