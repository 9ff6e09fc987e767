//! `GET /api/v1/models` — the upstream-permitted models for the
//! authenticated key.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_keys::ValidatedKeyData;
use relay_storage::KvStore;
use serde_json::json;

use crate::state::AppState;

pub fn router<S: KvStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/api/v1/models", get(list_models))
}

async fn list_models<S: KvStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Extension(validated): Extension<ValidatedKeyData>,
) -> impl IntoResponse {
    let all = state.pricing.model_ids();
    let models: Vec<String> = match &validated.key.restricted_models {
        Some(allowed) => all.into_iter().filter(|m| allowed.contains(m)).collect(),
        None => all,
    };
    Json(json!({"models": models}))
}
