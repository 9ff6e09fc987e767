//! HTTP error types for the relay server.
//!
//! Maps every domain error type from the component crates into one of a
//! small set of HTTP-facing shapes. `Display` on any wrapped error is safe
//! to surface: no component ever puts a raw secret or token into an error
//! message (tokens are masked before they reach a `thiserror` variant).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use relay_engine::RelayError;
use relay_keys::{KeyError, KeyServiceError};
use relay_lock::LockError;
use relay_pool::PoolError;
use relay_refresh::RefreshError;
use relay_scheduler::SchedulerError;
use relay_storage::StorageError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// No `x-api-key` header present.
    MissingApiKey,
    /// The key resolved to nothing usable (not found, disabled, expired, bad format).
    InvalidApiKey,
    /// Client-supplied request body failed a format check.
    InvalidRequest(String),
    /// A quota (rate limit, concurrency, cost) was exceeded.
    QuotaExceeded(String),
    /// The requested model is not permitted for this key.
    ModelNotPermitted(String),
    /// No upstream account could service the request.
    AllAccountsExhausted,
    /// The upstream dial/read timed out.
    UpstreamTimeout,
    /// An internal fault the caller cannot act on.
    Internal(String),
}

#[derive(Serialize)]
struct SimpleError {
    error: String,
}

#[derive(Serialize)]
struct DetailedError {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::MissingApiKey => {
                (StatusCode::UNAUTHORIZED, Json(SimpleError { error: "Missing API key".to_owned() }))
                    .into_response()
            }
            Self::InvalidApiKey => {
                (StatusCode::UNAUTHORIZED, Json(SimpleError { error: "Invalid API key".to_owned() }))
                    .into_response()
            }
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(DetailedError { error: "Invalid request", message }),
            )
                .into_response(),
            Self::QuotaExceeded(message) => {
                (StatusCode::TOO_MANY_REQUESTS, Json(SimpleError { error: message })).into_response()
            }
            Self::ModelNotPermitted(message) => (
                StatusCode::FORBIDDEN,
                Json(DetailedError { error: "Model not permitted", message }),
            )
                .into_response(),
            Self::AllAccountsExhausted => (
                StatusCode::BAD_GATEWAY,
                Json(SimpleError { error: "All upstream accounts are currently unavailable".to_owned() }),
            )
                .into_response(),
            Self::UpstreamTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                Json(SimpleError { error: "Upstream request timed out".to_owned() }),
            )
                .into_response(),
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(SimpleError { error: message })).into_response()
            }
        }
    }
}

impl From<KeyServiceError> for AppError {
    fn from(err: KeyServiceError) -> Self {
        match err {
            KeyServiceError::Key(KeyError::InvalidFormat) => Self::InvalidRequest(err.to_string()),
            KeyServiceError::Key(
                KeyError::NotFound | KeyError::Disabled | KeyError::Expired,
            ) => Self::InvalidApiKey,
            KeyServiceError::Key(
                KeyError::RateLimitExceeded
                | KeyError::ConcurrencyLimit
                | KeyError::DailyCostLimitExceeded
                | KeyError::WeeklyOpusCostLimitExceeded,
            ) => Self::QuotaExceeded(err.to_string()),
            KeyServiceError::Storage(_) | KeyServiceError::Decode { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ModelNotPermitted { ref model } => Self::ModelNotPermitted(model.clone()),
            RelayError::AllAccountsExhausted { .. } => Self::AllAccountsExhausted,
            RelayError::UpstreamTimeout => Self::UpstreamTimeout,
            RelayError::Key(inner) => inner.into(),
            RelayError::Scheduler(inner) => inner.into(),
            RelayError::Refresh(inner) => inner.into(),
            RelayError::Pool(inner) => inner.into(),
            RelayError::Storage(inner) => inner.into(),
            RelayError::UpstreamNetwork(_) | RelayError::UpstreamDecode(_) | RelayError::Cancelled => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::AllAccountsExhausted { .. } => Self::AllAccountsExhausted,
            SchedulerError::Storage(_) | SchedulerError::Decode { .. } | SchedulerError::NotFound { .. } => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<RefreshError> for AppError {
    fn from(err: RefreshError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        Self::Internal(err.to_string())
    }
}
