//! Shared application state for the relay server.
//!
//! A single [`AppState`] is built once at startup and shared across every
//! `axum` handler via `Arc`. It is generic over the storage backend: each
//! domain crate (`relay_keys`, `relay_scheduler`, `relay_refresh`) is itself
//! generic over `S: KvStore` rather than a trait object, so the server
//! picks one concrete backend at startup and instantiates the whole stack
//! against it (see `run` in `main.rs`).

use std::sync::Arc;

use relay_core::PricingTable;
use relay_engine::RelayEngine;
use relay_keys::KeyService;
use relay_scheduler::Scheduler;
use relay_storage::KvStore;

use crate::config::RelayConfig;

/// Shared state passed to all HTTP handlers.
pub struct AppState<S: KvStore> {
    pub keys: Arc<KeyService<S>>,
    pub scheduler: Arc<Scheduler<S>>,
    pub engine: Arc<RelayEngine<S>>,
    pub pricing: Arc<dyn PricingTable>,
    pub config: RelayConfig,
}

impl<S: KvStore> std::fmt::Debug for AppState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
