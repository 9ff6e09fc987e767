//! Storage error type.

/// Failures surfaced by a [`crate::KvStore`] implementation.
///
/// Every variant carries the key (or pattern) involved, mirroring this
/// codebase's existing storage error convention of naming the operation and
/// the offending key rather than a bare string.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    #[error("failed to list keys matching '{pattern}': {reason}")]
    List { pattern: String, reason: String },

    #[error("stored value for '{key}' is not valid UTF-8/JSON: {reason}")]
    Decode { key: String, reason: String },

    #[error("backend connection error: {0}")]
    Connection(String),
}
