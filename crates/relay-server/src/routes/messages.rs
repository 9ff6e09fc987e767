//! `POST /api/v1/messages` — the single relay endpoint. Dispatches to the
//! engine's unary or streaming flow depending on the request body's
//! `stream` field and renders the result as JSON or `text/event-stream`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use relay_engine::{HeaderBag, RelayStep};
use relay_keys::ValidatedKeyData;
use relay_storage::KvStore;
use serde_json::Value;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::state::AppState;

pub fn router<S: KvStore + 'static>() -> Router<Arc<AppState<S>>> {
    Router::new().route("/api/v1/messages", post(messages))
}

async fn messages<S: KvStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Extension(validated): Extension<ValidatedKeyData>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(err) = validate_body(&body) {
        return err.into_response();
    }

    let inbound = header_bag_from(&headers);
    let is_streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let cancel = CancellationToken::new();

    if is_streaming {
        stream_messages(state, validated, inbound, body, cancel).await
    } else {
        unary_message(state, validated, inbound, body, cancel).await
    }
}

async fn unary_message<S: KvStore + 'static>(
    state: Arc<AppState<S>>,
    validated: ValidatedKeyData,
    inbound: HeaderBag,
    body: Value,
    cancel: CancellationToken,
) -> Response {
    match state.engine.relay_unary(&validated.key, &inbound, body, &cancel).await {
        Ok(outcome) => {
            let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            (status, Json(outcome.body)).into_response()
        }
        Err(err) => AppError::from(err).into_response(),
    }
}

async fn stream_messages<S: KvStore + 'static>(
    state: Arc<AppState<S>>,
    validated: ValidatedKeyData,
    inbound: HeaderBag,
    body: Value,
    cancel: CancellationToken,
) -> Response {
    let mut rx = Arc::clone(&state.engine)
        .relay_streaming(validated.key, inbound, body, cancel)
        .await;

    // Peek the first step before committing to a streaming response: if the
    // engine exhausted every account before forwarding any byte, the error
    // must still surface as an HTTP status rather than an empty stream.
    let Some(first) = rx.recv().await else {
        return AppError::AllAccountsExhausted.into_response();
    };

    let body_stream = tokio_stream::once(first)
        .chain(ReceiverStream::new(rx))
        .filter_map(|step| match step {
            RelayStep::Forwarded(bytes) => Some(Ok::<_, Infallible>(bytes)),
            RelayStep::Done(_) | RelayStep::RetryWith(_) => None,
        });

    let mut response = Response::new(Body::from_stream(body_stream));
    response
        .headers_mut()
        .insert("content-type", HeaderValue::from_static("text/event-stream"));
    response
        .headers_mut()
        .insert("cache-control", HeaderValue::from_static("no-cache"));
    response
}

/// Boundary validation: `messages` must be present, non-empty, and an
/// array. Everything else is left to the engine/upstream.
fn validate_body(body: &Value) -> Result<(), AppError> {
    if body.get("model").and_then(Value::as_str).is_none() {
        return Err(AppError::InvalidRequest("request must include a \"model\" string".to_owned()));
    }

    match body.get("messages") {
        None => Err(AppError::InvalidRequest(
            "request must include a non-empty \"messages\" array".to_owned(),
        )),
        Some(Value::Array(items)) if items.is_empty() => Err(AppError::InvalidRequest(
            "request must include a non-empty \"messages\" array".to_owned(),
        )),
        Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(AppError::InvalidRequest("\"messages\" must be an array".to_owned())),
    }
}

fn header_bag_from(headers: &HeaderMap) -> HeaderBag {
    HeaderBag::from_pairs(headers.iter().filter_map(|(name, value)| {
        value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned()))
    }))
}
