use thiserror::Error;

/// Errors surfaced by the [`super::TaskStore`] trait.
///
/// Mirrors the teacher crate's `StoreError` shape: a small, flat enum
/// rather than a wrapped `anyhow::Error`, so callers can match on
/// `LeaseNotHeld` to distinguish "lost the race" from a genuine
/// transient failure.
#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("lease not held by caller")]
    LeaseNotHeld,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}
