//! Authentication middleware: `x-api-key` extraction, key validation, and
//! quota admission.
//!
//! Validated key data is injected into the request extensions so handlers
//! never re-resolve the secret; the concurrency slot taken by `admit_request`
//! is released once the handler's response has been produced.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use relay_storage::KvStore;
use tracing::warn;

use crate::error::AppError;
use crate::state::AppState;

/// Only mounted on the authenticated route group — `/healthz` is merged
/// outside this middleware's `route_layer` and never reaches it.
pub async fn auth_middleware<S: KvStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    mut req: Request,
    next: Next,
) -> Response {
    let secret = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let Some(secret) = secret else {
        return AppError::MissingApiKey.into_response();
    };

    let validated = match state.keys.validate_key(&secret).await {
        Ok(validated) => validated,
        Err(err) => return AppError::from(err).into_response(),
    };

    if let Err(err) = state.keys.admit_request(&validated.key).await {
        return AppError::from(err).into_response();
    }

    let key_id = validated.key.id.clone();
    let concurrency_limited = validated.key.concurrency_limit > 0;
    req.extensions_mut().insert(validated);

    let response = next.run(req).await;

    if concurrency_limited {
        if let Err(err) = state.keys.decr_concurrency(&key_id).await {
            warn!(key_id, error = %err, "failed to release concurrency slot");
        }
    }

    response
}
