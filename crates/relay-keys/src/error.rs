//! Key-service error type.

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key format")]
    InvalidFormat,

    #[error("key not found")]
    NotFound,

    #[error("key is disabled")]
    Disabled,

    #[error("key has expired")]
    Expired,

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("concurrency limit exceeded")]
    ConcurrencyLimit,

    #[error("daily cost limit exceeded")]
    DailyCostLimitExceeded,

    #[error("weekly opus cost limit exceeded")]
    WeeklyOpusCostLimitExceeded,
}

/// Storage failures are reported separately so callers can distinguish
/// "key is invalid" from "the store is unreachable".
#[derive(Debug, thiserror::Error)]
pub enum KeyServiceError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("storage error: {0}")]
    Storage(#[from] relay_storage::StorageError),

    #[error("stored key '{key_id}' is not valid JSON: {reason}")]
    Decode { key_id: String, reason: String },
}
