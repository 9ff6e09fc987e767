//! Relay engine error type.

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("model '{model}' is not permitted for this key")]
    ModelNotPermitted { model: String },

    #[error("key error: {0}")]
    Key(#[from] relay_keys::KeyServiceError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] relay_scheduler::SchedulerError),

    #[error("refresh error: {0}")]
    Refresh(#[from] relay_refresh::RefreshError),

    #[error("pool error: {0}")]
    Pool(#[from] relay_pool::PoolError),

    #[error("storage error: {0}")]
    Storage(#[from] relay_storage::StorageError),

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("upstream response body was not valid JSON: {0}")]
    UpstreamDecode(String),

    #[error("all accounts exhausted after {attempts} attempt(s)")]
    AllAccountsExhausted { attempts: u32 },

    #[error("request was cancelled by the inbound client")]
    Cancelled,
}
