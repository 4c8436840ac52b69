//! HTTP surface: the gate pipeline, its stages and the server hosting it.

mod gate;
mod idempotency;
mod pipeline;
mod rate_limit;
mod response;
mod server;

pub use gate::{load_policies, Gate};
pub use idempotency::{IdempotencyOptions, IdempotencyStage, IDEMPOTENCY_KEY_HEADER};
pub use pipeline::{gate_middleware, Endpoint, Next, Pipeline, Stage};
pub use rate_limit::RateLimitStage;
pub use response::{ProblemDetails, RateLimitExceeded};
pub use server::GateServer;
