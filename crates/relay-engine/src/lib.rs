//! Relay engine: the unary and SSE request/response pipeline.
//!
//! This crate composes every other domain crate into the single flow a
//! tenant request goes through: key validation and quota admission
//! ([`relay_keys`]), account selection ([`relay_scheduler`]), token refresh
//! ([`relay_refresh`]), request normalization, and the actual upstream call
//! ([`relay_pool`] via [`transport::UpstreamTransport`]). It owns no storage
//! of its own.

pub mod classify;
pub mod engine;
pub mod error;
pub mod headers;
pub mod normalize;
pub mod session;
pub mod stream;
pub mod transport;
pub mod usage;

pub use classify::{classify_response, reset_header_name, ResponseClass};
pub use engine::{EngineConfig, RelayEngine, UnaryOutcome};
pub use error::RelayError;
pub use headers::{build_outbound_headers, is_real_claude_code_request, HeaderBag};
pub use normalize::{normalize_request, NormalizeOptions};
pub use session::compute_session_hash;
pub use stream::{RelayStep, RetryReason, StreamContext};
pub use transport::{HttpUpstreamTransport, OutboundRequest, UpstreamResponse, UpstreamStreamResponse, UpstreamTransport};
