//! Lock coordinator error type.

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("storage error acquiring lock '{key}': {source}")]
    Storage {
        key: String,
        #[source]
        source: relay_storage::StorageError,
    },

    /// Not fatal: the caller should treat this as "skip, someone else
    /// is already refreshing" rather than retry the whole request.
    #[error("lock '{key}' is already held")]
    Contended { key: String },
}
