//! Crate-local error type for domain-model construction failures.

/// Errors raised while building or validating domain-model values.
///
/// This crate has no I/O, so this enum is intentionally small: it only
/// covers malformed input encountered while parsing stored scalars back
/// into typed values.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("unknown account type '{0}'")]
    UnknownAccountType(String),

    #[error("no pricing entry for model '{model}'")]
    UnknownModel { model: String },
}
