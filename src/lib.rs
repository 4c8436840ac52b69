//! Edgegate - Rate Limiting and Idempotency at the HTTP Edge
//!
//! This crate implements a request gate that sits in front of an axum
//! router. Requests to protected routes pass a per-client sliding-window
//! rate limiter, and mutating requests carrying an idempotency key have
//! their first successful response cached and replayed for repeats.

pub mod clock;
pub mod config;
pub mod demo;
pub mod error;
pub mod http;
pub mod idempotency;
pub mod ratelimit;
pub mod store;
