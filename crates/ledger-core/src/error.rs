//! Ledger error taxonomy

use ledger_common::{DomainError, FeatureId, GrantId, StoreError};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::coordinator::LockKey;

/// Phrase shown to end users when a deduction cannot be covered
pub const MSG_INSUFFICIENT: &str = "not enough remaining balance";

/// Phrase shown to end users for anything transient or internal
pub const MSG_UNAVAILABLE: &str = "temporarily unavailable, retry";

/// Ledger error types
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Deduction cannot be satisfied and overage is not allowed
    #[error("insufficient balance for {feature_id}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Feature being deducted
        feature_id: FeatureId,
        /// Amount the caller asked for
        requested: Decimal,
        /// Amount that could have been covered
        available: Decimal,
    },

    /// Customer lock could not be acquired within the retry budget
    #[error("lock contention on {key} after {attempts} attempts")]
    LockContention {
        /// Lock that was busy
        key: LockKey,
        /// Attempts made
        attempts: u32,
    },

    /// Grant expired or changed between resolution and write
    #[error("stale grant {0}")]
    StaleGrant(GrantId),

    /// Feature metadata disagrees with the operation
    #[error("configuration inconsistency: {0}")]
    ConfigInconsistency(String),

    /// Stored data violates a ledger invariant
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Feature missing from catalog
    #[error("feature not found: {0}")]
    FeatureNotFound(FeatureId),

    /// Nothing can receive a credit
    #[error("no eligible grant for {0}")]
    NoEligibleGrant(FeatureId),

    /// Feature is tracked per entity and the request named none
    #[error("feature {0} is tracked per entity; an entity is required")]
    EntityRequired(FeatureId),

    /// Caller supplied an unusable amount
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Top-up purchase failed
    #[error("replenishment failed: {0}")]
    Replenishment(String),

    /// A background stage is gone
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Durable store failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Value object failure
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl LedgerError {
    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockContention { .. }
                | Self::StaleGrant(_)
                | Self::Unavailable(_)
                | Self::Store(StoreError::Conflict(_))
        )
    }

    /// Whether the error points at broken data and should page someone
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::ConfigInconsistency(_))
    }

    /// Message safe to surface to end users
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::InsufficientBalance { .. } => MSG_INSUFFICIENT,
            _ => MSG_UNAVAILABLE,
        }
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_common::CustomerId;
    use rust_decimal_macros::dec;

    #[test]
    fn test_user_messages_never_leak_internals() {
        let insufficient = LedgerError::InsufficientBalance {
            feature_id: FeatureId::new("messages").unwrap(),
            requested: dec!(10),
            available: dec!(4),
        };
        assert_eq!(insufficient.user_message(), MSG_INSUFFICIENT);
        assert!(!insufficient.is_retryable());

        let corruption = LedgerError::Corruption("negative granted balance".into());
        assert_eq!(corruption.user_message(), MSG_UNAVAILABLE);
        assert!(corruption.is_fatal());
    }

    #[test]
    fn test_contention_is_retryable() {
        let err = LedgerError::LockContention {
            key: LockKey::customer(CustomerId::new("cus_1").unwrap()),
            attempts: 3,
        };
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), MSG_UNAVAILABLE);
    }
}
