//! Connection pool error type.

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No healthy transport was available when `get_connection` was called.
    /// The caller (scheduler) should treat this as a reason to pick another
    /// account, not retry the same one.
    #[error("account '{account_id}' has no healthy outbound connection")]
    Degraded { account_id: String },

    #[error("failed to build outbound transport for '{account_id}': {reason}")]
    Build { account_id: String, reason: String },
}
