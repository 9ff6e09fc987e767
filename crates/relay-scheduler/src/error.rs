//! Scheduler error type.

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] relay_storage::StorageError),

    #[error("stored account record '{account_id}' is not valid JSON: {reason}")]
    Decode { account_id: String, reason: String },

    /// No candidate account satisfied provider/status/restriction constraints.
    #[error("no eligible upstream account for provider '{provider}'")]
    AllAccountsExhausted { provider: String },

    #[error("account '{account_id}' not found")]
    NotFound { account_id: String },
}
