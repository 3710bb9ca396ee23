use thiserror::Error;

use stockledger_core::DomainError;

/// Failure at the storage boundary.
///
/// Domain rule violations pass through unchanged so callers can match on
/// `InsufficientStock`, `Conflict` and friends regardless of the backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Backend failure (connection, query, decoding).
    #[error("storage error: {0}")]
    Storage(String),

    /// A concurrent writer won a race (unique violation, serialization failure).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Stable code for logs and alert payloads.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Domain(e) => e.code(),
            StoreError::Storage(_) => "storage",
            StoreError::Concurrency(_) => "concurrency",
            StoreError::LockPoisoned => "lock_poisoned",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
