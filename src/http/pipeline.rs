//! Ordered chain of gate stages.
//!
//! Each stage sees the request and a [`Next`] handle to the rest of the
//! chain. It either answers on its own or awaits `next.run(req)`. The chain
//! ends in an [`Endpoint`], which in production is the router's remaining
//! service and in tests can be any closure.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware;
use axum::response::Response;
use futures::future::BoxFuture;
use futures::FutureExt;

/// The handler the chain hands requests to after every stage passed them on.
pub type Endpoint = Box<dyn FnOnce(Request) -> BoxFuture<'static, Response> + Send>;

/// A gate stage: `(request, next) -> response`.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs.
    fn name(&self) -> &'static str;

    /// Handle a request, calling `next.run` to continue down the chain.
    async fn handle(&self, req: Request, next: Next<'_>) -> Response;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    endpoint: Endpoint,
}

impl<'a> Next<'a> {
    /// Pass the request to the next stage, or to the endpoint after the last.
    pub fn run(self, req: Request) -> BoxFuture<'a, Response> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    endpoint: self.endpoint,
                };
                stage.handle(req, next)
            }
            None => (self.endpoint)(req),
        }
    }
}

/// Stages composed once at startup, run in order for every request.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage, builder style.
    pub fn with_stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Names of the stages, in order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run `req` through every stage and then `endpoint`.
    pub async fn run(&self, req: Request, endpoint: Endpoint) -> Response {
        Next {
            stages: &self.stages,
            endpoint,
        }
        .run(req)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}

/// Matched route template, or the raw path outside a router.
pub(crate) fn route_template(req: &Request) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Axum middleware running the pipeline in front of the matched route.
pub async fn gate_middleware(
    State(pipeline): State<Arc<Pipeline>>,
    req: Request,
    next: middleware::Next,
) -> Response {
    let endpoint: Endpoint = Box::new(move |req| async move { next.run(req).await }.boxed());
    pipeline.run(req, endpoint).await
}
