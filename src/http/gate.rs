//! Composition root: turns configuration into a pipeline and installs it on
//! a router.

use std::sync::Arc;

use axum::{middleware, Router};
use tracing::info;

use super::idempotency::{IdempotencyOptions, IdempotencyStage};
use super::pipeline::{gate_middleware, Pipeline};
use super::rate_limit::RateLimitStage;
use crate::clock::Clock;
use crate::config::{GateConfig, LimiterBackendKind, RateLimitingConfig};
use crate::error::Result;
use crate::idempotency::IdempotencyStore;
use crate::ratelimit::{
    ClientIdentifier, PolicyTable, RateLimiterBackend, SlidingWindowLimiter, StoreWindowLimiter,
};
use crate::store::KeyValueStore;

/// The configured gate: rate limiting first, then idempotency.
#[derive(Debug, Clone)]
pub struct Gate {
    pipeline: Arc<Pipeline>,
}

impl Gate {
    /// Wrap an already assembled pipeline.
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    /// Assemble the gate described by `config`.
    ///
    /// `store` backs the idempotency cache and, with the `store` backend, the
    /// rate limiter's windows. `clock` drives every time-dependent decision.
    pub fn from_config(
        config: &GateConfig,
        policies: PolicyTable,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let mut pipeline = Pipeline::new();
        // Both stages see callers the same way.
        let identifier = ClientIdentifier::new(
            config.rate_limiting.trust_forwarded_for,
            config.rate_limiting.session_cookie.clone(),
        );

        if config.rate_limiting.enabled {
            let limiter = build_limiter(&config.rate_limiting, store.clone(), clock);
            info!(
                routes = policies.len(),
                backend = ?config.rate_limiting.backend,
                "Rate limiting enabled"
            );
            pipeline = pipeline.with_stage(RateLimitStage::new(
                Arc::new(policies),
                limiter,
                identifier.clone(),
            ));
        }

        if config.idempotency.enabled {
            let idem = &config.idempotency;
            let store = IdempotencyStore::with_ttl(store, idem.ttl(), idem.claim_ttl());
            let options = IdempotencyOptions {
                header_name: idem.header_name.clone(),
                mark_replays: idem.mark_replays,
                claim_in_flight: idem.claim_in_flight,
                max_cached_body_bytes: idem.max_cached_body_bytes,
            };
            info!(
                header = %idem.header_name,
                ttl_secs = idem.ttl_secs,
                claim_in_flight = idem.claim_in_flight,
                "Idempotency enabled"
            );
            pipeline = pipeline.with_stage(IdempotencyStage::new(store, identifier, options));
        }

        Ok(Self::new(pipeline))
    }

    /// The assembled pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Install the gate in front of every route registered on `router` so far.
    ///
    /// Installed as a route layer so the matched route template is visible to
    /// the stages. Routes added afterwards are not gated.
    pub fn layer<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(middleware::from_fn_with_state(
            self.pipeline.clone(),
            gate_middleware,
        ))
    }
}

/// Build the policy table from inline routes plus the optional policy file.
pub fn load_policies(config: &RateLimitingConfig) -> Result<PolicyTable> {
    let mut table = PolicyTable::from_routes(&config.routes)?;
    if let Some(path) = &config.policy_path {
        table.merge(PolicyTable::from_file(path)?)?;
    }
    Ok(table)
}

fn build_limiter(
    config: &RateLimitingConfig,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RateLimiterBackend> {
    match config.backend {
        LimiterBackendKind::Local => Arc::new(SlidingWindowLimiter::with_settings(
            clock,
            config.cleanup_interval(),
            config.stale_after(),
        )),
        LimiterBackendKind::Store => Arc::new(StoreWindowLimiter::with_clock(
            store,
            clock,
            config.store_max_retries,
        )),
    }
}
