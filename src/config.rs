//! Configuration management for edgegate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GateError, Result};
use crate::ratelimit::RoutePolicy;

/// Prefix for environment overrides, e.g. `EDGEGATE__SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "EDGEGATE";

/// Main configuration for the gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Idempotency configuration
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Where client windows are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterBackendKind {
    /// In-process map, one window set per instance
    #[default]
    Local,
    /// The shared key-value store, one window set for all instances
    Store,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whether the rate limit stage is installed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limiter backend
    #[serde(default)]
    pub backend: LimiterBackendKind,

    /// Minimum seconds between sweeps of idle client windows
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Idle seconds after which a client window is evicted
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Trust the leftmost `X-Forwarded-For` entry as the client address
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Cookie carrying the session id for unauthenticated callers
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    /// Optional YAML file with additional route policies
    #[serde(default)]
    pub policy_path: Option<String>,

    /// Route policies
    #[serde(default)]
    pub routes: Vec<RoutePolicy>,

    /// Compare-and-swap attempts per check for the store backend
    #[serde(default = "default_store_max_retries")]
    pub store_max_retries: u32,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: LimiterBackendKind::default(),
            cleanup_interval_secs: default_cleanup_interval(),
            stale_after_secs: default_stale_after(),
            trust_forwarded_for: false,
            session_cookie: default_session_cookie(),
            policy_path: None,
            routes: Vec::new(),
            store_max_retries: default_store_max_retries(),
        }
    }
}

impl RateLimitingConfig {
    /// Interval between reaper sweeps.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Idle time before eviction.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_stale_after() -> u64 {
    300
}

fn default_session_cookie() -> String {
    "session_id".to_string()
}

fn default_store_max_retries() -> u32 {
    8
}

/// Idempotency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Whether the idempotency stage is installed
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Request header carrying the key
    #[serde(default = "default_header_name")]
    pub header_name: String,

    /// Lifetime of cached responses in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Add `X-Idempotent-Replayed: true` to replayed responses
    #[serde(default)]
    pub mark_replays: bool,

    /// Answer concurrent duplicates of an in-flight key with 409
    #[serde(default)]
    pub claim_in_flight: bool,

    /// Lifetime of an in-flight claim in seconds
    #[serde(default = "default_claim_ttl")]
    pub claim_ttl_secs: u64,

    /// Largest response body that is cached
    #[serde(default = "default_max_cached_body_bytes")]
    pub max_cached_body_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header_name: default_header_name(),
            ttl_secs: default_ttl(),
            mark_replays: false,
            claim_in_flight: false,
            claim_ttl_secs: default_claim_ttl(),
            max_cached_body_bytes: default_max_cached_body_bytes(),
        }
    }
}

impl IdempotencyConfig {
    /// Lifetime of cached responses.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Lifetime of in-flight claims.
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }
}

fn default_header_name() -> String {
    "X-Idempotency-Key".to_string()
}

fn default_ttl() -> u64 {
    86400
}

fn default_claim_ttl() -> u64 {
    30
}

fn default_max_cached_body_bytes() -> usize {
    1024 * 1024
}

impl GateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file plus `EDGEGATE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.cleanup_interval_secs == 0 {
            return Err(GateError::Config(
                "rate_limiting.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if rl.stale_after_secs <= rl.cleanup_interval_secs {
            return Err(GateError::Config(format!(
                "rate_limiting.stale_after_secs ({}) must exceed cleanup_interval_secs ({})",
                rl.stale_after_secs, rl.cleanup_interval_secs
            )));
        }

        let idem = &self.idempotency;
        if idem.ttl_secs == 0 {
            return Err(GateError::Config(
                "idempotency.ttl_secs must be positive".to_string(),
            ));
        }
        if idem.claim_in_flight && idem.claim_ttl_secs == 0 {
            return Err(GateError::Config(
                "idempotency.claim_ttl_secs must be positive when claims are enabled".to_string(),
            ));
        }
        if axum::http::HeaderName::from_bytes(idem.header_name.as_bytes()).is_err() {
            return Err(GateError::Config(format!(
                "idempotency.header_name {:?} is not a valid header name",
                idem.header_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GateConfig::default();
        assert_eq!(config.server.http_addr.port(), 8080);
        assert_eq!(config.rate_limiting.backend, LimiterBackendKind::Local);
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.idempotency.ttl(), Duration::from_secs(86400));
        assert_eq!(config.idempotency.header_name, "X-Idempotency-Key");
        assert!(!config.idempotency.claim_in_flight);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
rate_limiting:
  backend: store
  cleanup_interval_secs: 30
  stale_after_secs: 120
  routes:
    - method: POST
      path: /reviews
      max_requests: 5
      window_seconds: 60
idempotency:
  mark_replays: true
"#;
        let config: GateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.rate_limiting.backend, LimiterBackendKind::Store);
        assert_eq!(config.rate_limiting.routes.len(), 1);
        assert!(config.idempotency.mark_replays);
        assert_eq!(config.idempotency.ttl_secs, 86400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stale_threshold_must_exceed_interval() {
        let mut config = GateConfig::default();
        config.rate_limiting.cleanup_interval_secs = 60;
        config.rate_limiting.stale_after_secs = 60;
        assert!(matches!(config.validate(), Err(GateError::Config(_))));
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let mut config = GateConfig::default();
        config.idempotency.header_name = "bad header".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = GateConfig::load(None).unwrap();
        assert!(config.rate_limiting.enabled);
        assert!(config.idempotency.enabled);
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let err = GateConfig::from_file("/nonexistent/edgegate.yaml").unwrap_err();
        assert!(matches!(err, GateError::Io(_)));
    }
}
