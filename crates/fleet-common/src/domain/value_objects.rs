//! Value Objects - Immutable, self-validating fleet identifiers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// PoP name (Value Object)
///
/// # Invariants
/// - Must be non-empty
/// - Max 64 characters
/// - Alphanumeric with hyphens and underscores only
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PopName(String);

impl PopName {
    /// Create new PoP name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();

        if name.is_empty() {
            return Err(DomainError::InvalidPopName("cannot be empty".into()));
        }
        if name.len() > 64 {
            return Err(DomainError::InvalidPopName("max 64 characters".into()));
        }
        if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Err(DomainError::InvalidPopName("alphanumeric only".into()));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PopName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PopName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PopName> for String {
    fn from(name: PopName) -> Self {
        name.0
    }
}

/// Workload owner identifier (Value Object)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create new owner ID
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidOwnerId("cannot be empty".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host identifier (Value Object)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(Uuid);

impl HostId {
    /// Generate a fresh host ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Domain errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("invalid PoP name: {0}")]
    InvalidPopName(String),

    #[error("invalid owner ID: {0}")]
    InvalidOwnerId(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
