//! HTTP boundary for the LLM relay proxy.
//!
//! Wires the domain crates (key service, scheduler, refresh coordinator,
//! relay engine) into a running `axum` server: request authentication,
//! route handlers, and the `AppError` mapping that turns internal failures
//! into the exact response shapes clients depend on.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
