//! `GET /healthz` — unauthenticated liveness probe. Never touches the KV
//! store, so it stays responsive even if storage is degraded.

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

use relay_storage::KvStore;

use crate::state::AppState;

pub fn router<S: KvStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/healthz", get(health))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}
