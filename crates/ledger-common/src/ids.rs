//! Identifier value objects
//!
//! External identifiers (customers, entities, features) are caller-supplied
//! strings and are validated on construction:
//! - non-empty
//! - at most 128 characters
//! - alphanumeric, `-`, `_`, `.` or `:` only
//!
//! Internal identifiers (grants, buckets) are v4 UUIDs minted by the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::DomainError;

const MAX_ID_LEN: usize = 128;

fn validate(kind: &'static str, id: &str) -> Result<(), DomainError> {
    if id.is_empty() {
        return Err(DomainError::InvalidId { kind, reason: "cannot be empty" });
    }
    if id.len() > MAX_ID_LEN {
        return Err(DomainError::InvalidId { kind, reason: "max 128 characters" });
    }
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(DomainError::InvalidId { kind, reason: "unsupported character" });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create with validation
            pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
                let id = id.into();
                validate($kind, &id)?;
                Ok(Self(id))
            }

            /// Get inner value
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random id
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get inner UUID
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Customer identifier (Value Object)
    CustomerId,
    "customer"
);

string_id!(
    /// Entity identifier: a sub-account of a customer such as a seat or user
    EntityId,
    "entity"
);

string_id!(
    /// Feature identifier (e.g. `messages`, `seats`, `credits`)
    FeatureId,
    "feature"
);

uuid_id!(
    /// Entitlement grant identifier
    GrantId
);

uuid_id!(
    /// Rollover bucket identifier
    BucketId
);
