//! Error types for fleet allocation

use crate::domain::{DomainError, RegistryError};
use thiserror::Error;

/// Allocation error type
///
/// `Conflict` is produced by the coordinator when a registry claim comes
/// back `AlreadyExists`, and is absorbed by its retry loop. Every other
/// variant reaches the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Pool or parent-prefix configuration is absent
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Configuration is present but cannot produce candidates
    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// No free address or prefix remains
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A claim lost a race to a concurrent caller
    #[error("conflict: {0}")]
    Conflict(String),

    /// Referenced PoP or host does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Record with the same key already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Registry backend failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid domain value
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Result type for fleet allocation
pub type AllocResult<T> = Result<T, AllocError>;

impl From<RegistryError> for AllocError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(what) => AllocError::NotFound(what),
            RegistryError::AlreadyExists(what) => AllocError::AlreadyExists(what),
            RegistryError::StorageError(what) => AllocError::Storage(what),
        }
    }
}
