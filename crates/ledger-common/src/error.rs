//! Error types shared by ledger crates

use thiserror::Error;

/// Errors raised by a durable store implementation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Row or aggregate does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic version check failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Validation errors for value objects
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Identifier failed validation
    #[error("invalid {kind} id: {reason}")]
    InvalidId {
        /// Which identifier
        kind: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Timestamp arithmetic left the representable range
    #[error("timestamp out of range")]
    TimestampOutOfRange,
}
