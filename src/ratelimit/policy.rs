//! Per-route rate limit policies.
//!
//! Policies are attached to routes once at startup and never change while
//! the process runs. A route with no entry in the [`PolicyTable`] is not
//! rate limited at all.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use axum::http::Method;
use tracing::info;

use crate::error::{GateError, Result};

/// A rate limit: at most `max_requests` admissions in any trailing
/// `window_seconds` interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum admitted requests inside one window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u32,
}

impl RateLimitPolicy {
    /// Create a policy, rejecting zero-valued limits.
    pub fn new(max_requests: u32, window_seconds: u32) -> Result<Self> {
        if max_requests == 0 || window_seconds == 0 {
            return Err(GateError::Config(format!(
                "rate limit policy must be positive, got {} requests per {}s",
                max_requests, window_seconds
            )));
        }
        Ok(Self {
            max_requests,
            window_seconds,
        })
    }

    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_seconds))
    }
}

/// One route's policy as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePolicy {
    /// HTTP method, e.g. `POST`
    pub method: String,
    /// Route template as registered with the router, e.g. `/reviews/{id}`
    pub path: String,
    /// Maximum admitted requests inside one window
    pub max_requests: u32,
    /// Window length in seconds
    pub window_seconds: u32,
}

/// File format for a standalone policy file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    /// Route policies
    #[serde(default)]
    pub routes: Vec<RoutePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: Method,
    template: String,
}

/// Static policy table keyed by (method, route template).
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    routes: HashMap<RouteKey, RateLimitPolicy>,
}

impl PolicyTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a policy to a route, builder style.
    pub fn with_route(
        mut self,
        method: Method,
        template: impl Into<String>,
        policy: RateLimitPolicy,
    ) -> Result<Self> {
        self.insert(method, template, policy)?;
        Ok(self)
    }

    /// Attach a policy to a route. A route may only be attached once.
    pub fn insert(
        &mut self,
        method: Method,
        template: impl Into<String>,
        policy: RateLimitPolicy,
    ) -> Result<()> {
        let key = RouteKey {
            method,
            template: template.into(),
        };
        if self.routes.contains_key(&key) {
            return Err(GateError::Config(format!(
                "duplicate rate limit policy for {} {}",
                key.method, key.template
            )));
        }
        self.routes.insert(key, policy);
        Ok(())
    }

    /// Build a table from configured route policies.
    pub fn from_routes<'a, I>(routes: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a RoutePolicy>,
    {
        let mut table = Self::new();
        table.extend(routes)?;
        Ok(table)
    }

    /// Add configured route policies to the table.
    pub fn extend<'a, I>(&mut self, routes: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a RoutePolicy>,
    {
        for route in routes {
            let method = Method::from_bytes(route.method.to_ascii_uppercase().as_bytes())
                .map_err(|e| {
                    GateError::Config(format!("invalid method {:?}: {}", route.method, e))
                })?;
            let policy = RateLimitPolicy::new(route.max_requests, route.window_seconds)?;
            self.insert(method, route.path.clone(), policy)?;
        }
        Ok(())
    }

    /// Move every policy of `other` into this table.
    ///
    /// Fails on the first route both tables protect.
    pub fn merge(&mut self, other: PolicyTable) -> Result<()> {
        for (key, policy) in other.routes {
            self.insert(key.method, key.template, policy)?;
        }
        Ok(())
    }

    /// Load a table from a YAML policy file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: PolicyFile = serde_yaml::from_str(yaml)
            .map_err(|e| GateError::Config(format!("Failed to parse policy file: {}", e)))?;
        Self::from_routes(&file.routes)
    }

    /// Resolve the policy attached to a matched route.
    pub fn resolve(&self, method: &Method, template: &str) -> Option<RateLimitPolicy> {
        // Lookup by borrowed key would need a custom Borrow impl; the owned
        // key is cheap next to the request itself.
        self.routes
            .get(&RouteKey {
                method: method.clone(),
                template: template.to_string(),
            })
            .copied()
    }

    /// Number of protected routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no route is protected.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
