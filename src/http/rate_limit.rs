//! Rate limiting gate stage.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tracing::{trace, warn};

use super::pipeline::{route_template, Next, Stage};
use super::response::RateLimitExceeded;
use crate::ratelimit::{ClientIdentifier, Decision, PolicyTable, RateLimiterBackend, WindowKey};

/// Rejects callers that exceeded the policy attached to the matched route.
pub struct RateLimitStage {
    policies: Arc<PolicyTable>,
    limiter: Arc<dyn RateLimiterBackend>,
    identifier: ClientIdentifier,
}

impl RateLimitStage {
    /// Create the stage.
    pub fn new(
        policies: Arc<PolicyTable>,
        limiter: Arc<dyn RateLimiterBackend>,
        identifier: ClientIdentifier,
    ) -> Self {
        Self {
            policies,
            limiter,
            identifier,
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn handle(&self, req: Request, next: Next<'_>) -> Response {
        let route = route_template(&req);
        let Some(policy) = self.policies.resolve(req.method(), &route) else {
            return next.run(req).await;
        };

        let client = self.identifier.identify(&req);
        let window = WindowKey::new(client.clone(), req.method().clone(), route.clone());
        match self.limiter.check(&window, &policy).await {
            Decision::Admitted { remaining } => {
                trace!(client = %client, route = %route, remaining = remaining, "Request admitted");
                next.run(req).await
            }
            Decision::Rejected { .. } => {
                warn!(
                    client = %client,
                    method = %req.method(),
                    route = %route,
                    max_requests = policy.max_requests,
                    window_seconds = policy.window_seconds,
                    "Rate limit exceeded"
                );
                RateLimitExceeded::for_policy(&policy).into_response()
            }
        }
    }
}
