//! `GET /api/v1/usage` — aggregated usage counters for the authenticated
//! key, as observed at the last validation (bounded by the validation
//! cache's TTL).

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
    Router::new().route("/api/v1/usage", get(usage))
}

async fn usage(Extension(validated): Extension<ValidatedKeyData>) -> impl IntoResponse {
    Json(json!({
        "total_tokens_used": validated.total_tokens_used,
        "daily_cost": validated.daily_cost,
        "weekly_opus_cost": validated.weekly_opus_cost,
        "token_limit": validated.key.token_limit,
        "daily_cost_limit": validated.key.daily_cost_limit,
        "weekly_opus_cost_limit": validated.key.weekly_opus_cost_limit,
    }))
}
