//! Token refresh error type.

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("lock error: {0}")]
    Lock(#[from] relay_lock::LockError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] relay_scheduler::SchedulerError),

    #[error("account '{account_id}' not found")]
    AccountNotFound { account_id: String },

    #[error("OAuth token exchange failed for platform '{platform}', account '{account_id}' (attempt {attempt}): {reason}")]
    Exchange {
        platform: String,
        account_id: String,
        attempt: u32,
        reason: String,
    },
}
