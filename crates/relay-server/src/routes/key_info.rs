//! `GET /api/v1/key-info` — a redacted representation of the authenticated
//! key. `hashed_secret` is never included in any response body.

use axum::extract::Extension;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use relay_keys::ValidatedKeyData;
use relay_storage::KvStore;
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

pub fn router<S: KvStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/api/v1/key-info", get(key_info))
}

async fn key_info(Extension(validated): Extension<ValidatedKeyData>) -> impl IntoResponse {
    let key = &validated.key;
    Json(json!({
        "id": key.id,
        "name": key.name,
        "active": key.active,
        "expires_at": key.expires_at,
        "created_at": key.created_at,
        "last_used_at": key.last_used_at,
        "token_limit": key.token_limit,
        "concurrency_limit": key.concurrency_limit,
        "rate_limit_window_minutes": key.rate_limit_window_minutes,
        "rate_limit_requests": key.rate_limit_requests,
        "rate_limit_cost": key.rate_limit_cost,
        "restricted_models": key.restricted_models,
        "allowed_clients": key.allowed_clients,
        "tags": key.tags,
    }))
}
