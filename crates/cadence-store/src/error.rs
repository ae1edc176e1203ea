//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for cadence_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => cadence_core::Error::NotFound(what),
            other => cadence_core::Error::Storage(other.to_string()),
        }
    }
}
