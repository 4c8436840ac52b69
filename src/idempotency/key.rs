//! Client-supplied idempotency keys.

use std::str::FromStr;

use axum::http::Method;
use uuid::Uuid;

use crate::ratelimit::ClientKey;

/// A well-formed idempotency key.
///
/// Keys must be UUIDs. Any textual form `uuid` accepts is allowed, and the
/// key is stored in canonical lowercase hyphenated form so equivalent
/// spellings deduplicate together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    /// Parse a header value into a key.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(value.trim()).map(Self)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for IdempotencyKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

/// An idempotency key bound to the caller and the route it was sent to.
///
/// Cached responses and claims are stored under this, so a key reused by
/// another caller, or by the same caller on another route, never replays a
/// response that was not theirs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopedKey {
    key: IdempotencyKey,
    scope: String,
}

impl ScopedKey {
    /// Scope `key` to `client` calling `method route`.
    pub fn new(key: IdempotencyKey, client: &ClientKey, method: &Method, route: &str) -> Self {
        Self {
            key,
            scope: format!("{}:{} {}", client, method, route),
        }
    }

    /// The client-supplied key.
    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Caller and route the key is bound to.
    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl std::fmt::Display for ScopedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.key)
    }
}
