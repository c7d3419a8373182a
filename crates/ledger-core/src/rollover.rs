//! Rollover buckets
//!
//! Unused balance carried out of a finished cycle. Buckets are created only by
//! a reset, drained only by deductions, and never extended.

use ledger_common::{BucketId, DomainError, EntityId, GrantId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How long carried balance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloverDuration {
    /// `length` calendar months
    Month,
    /// Never expires
    Forever,
}

/// Carry-over policy of a grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Cap per bucket (per entity slice for per-entity grants), `None` is uncapped
    pub max: Option<Decimal>,
    pub duration: RolloverDuration,
    #[serde(default = "default_length")]
    pub length: u32,
}

fn default_length() -> u32 {
    1
}

impl RolloverPolicy {
    /// Carry at most `max`, expiring after `length` months
    pub fn monthly(max: Option<Decimal>, length: u32) -> Self {
        Self {
            max,
            duration: RolloverDuration::Month,
            length,
        }
    }

    /// Carry at most `max`, forever
    pub fn forever(max: Option<Decimal>) -> Self {
        Self {
            max,
            duration: RolloverDuration::Forever,
            length: 1,
        }
    }

    /// Amount of `unused` that may be carried
    pub fn carry(&self, unused: Decimal) -> Decimal {
        let unused = unused.max(Decimal::ZERO);
        match self.max {
            Some(cap) => unused.min(cap.max(Decimal::ZERO)),
            None => unused,
        }
    }

    /// Expiry of a bucket created at `now`
    pub fn expiry_from(&self, now: Timestamp) -> Result<Option<Timestamp>, DomainError> {
        match self.duration {
            RolloverDuration::Month => now.add_months(self.length.max(1)).map(Some),
            RolloverDuration::Forever => Ok(None),
        }
    }
}

/// One entity's share of a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSlice {
    pub balance: Decimal,
    pub usage: Decimal,
}

/// Dated, capped carry-over of unused balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverBucket {
    pub id: BucketId,
    pub grant_id: GrantId,
    pub balance: Decimal,
    pub usage: Decimal,
    pub expires_at: Option<Timestamp>,
    /// Cap in force at creation
    pub cap: Option<Decimal>,
    /// Creation order within the grant
    pub sequence: u64,
    pub created_at: Timestamp,
    #[serde(default)]
    pub(crate) entities: Option<BTreeMap<EntityId, BucketSlice>>,
}

impl RolloverBucket {
    /// Customer-level bucket
    pub fn new(
        grant_id: GrantId,
        balance: Decimal,
        expires_at: Option<Timestamp>,
        sequence: u64,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: BucketId::new_v4(),
            grant_id,
            balance,
            usage: Decimal::ZERO,
            expires_at,
            cap: None,
            sequence,
            created_at,
            entities: None,
        }
    }

    /// Record the cap the bucket was created under
    pub fn with_cap(mut self, cap: Option<Decimal>) -> Self {
        self.cap = cap;
        self
    }

    /// Split into per-entity slices; the aggregate follows
    pub fn with_entities(mut self, balances: BTreeMap<EntityId, Decimal>) -> Self {
        let slices = balances
            .into_iter()
            .map(|(e, balance)| {
                (
                    e,
                    BucketSlice {
                        balance,
                        usage: Decimal::ZERO,
                    },
                )
            })
            .collect();
        self.entities = Some(slices);
        self.recompute_aggregate();
        self
    }

    /// Override id (fixtures and imports)
    pub fn with_id(mut self, id: BucketId) -> Self {
        self.id = id;
        self
    }

    /// Expired buckets are ignored by every read and deduction
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Per-entity slices, if any
    pub fn entity_slices(&self) -> Option<&BTreeMap<EntityId, BucketSlice>> {
        self.entities.as_ref()
    }

    /// Remaining balance for a scope
    pub fn balance_for(&self, entity: Option<&EntityId>) -> Decimal {
        match (entity, &self.entities) {
            (Some(e), Some(slices)) => slices.get(e).map_or(Decimal::ZERO, |s| s.balance),
            _ => self.balance,
        }
    }

    /// Draw `amount` from a scope
    pub(crate) fn consume(&mut self, entity: Option<&EntityId>, amount: Decimal) {
        match (entity, self.entities.as_mut()) {
            (Some(e), Some(slices)) => {
                if let Some(slice) = slices.get_mut(e) {
                    slice.balance -= amount;
                    slice.usage += amount;
                }
                self.recompute_aggregate();
            }
            _ => {
                self.balance -= amount;
                self.usage += amount;
            }
        }
    }

    fn recompute_aggregate(&mut self) {
        if let Some(slices) = &self.entities {
            self.balance = slices.values().map(|s| s.balance).sum();
            self.usage = slices.values().map(|s| s.usage).sum();
        }
    }

    /// Check stored invariants
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.balance < Decimal::ZERO {
            return Err(format!("bucket {} has negative balance", self.id));
        }
        if let Some(slices) = &self.entities {
            if slices.values().any(|s| s.balance < Decimal::ZERO) {
                return Err(format!("bucket {} has a negative entity slice", self.id));
            }
            if let Some(cap) = self.cap {
                if slices.values().any(|s| s.balance > cap) {
                    return Err(format!("bucket {} slice exceeds its cap", self.id));
                }
            }
            let sum: Decimal = slices.values().map(|s| s.balance).sum();
            if sum != self.balance {
                return Err(format!("bucket {} aggregate differs from its entity slices", self.id));
            }
        } else if let Some(cap) = self.cap {
            if self.balance > cap {
                return Err(format!("bucket {} exceeds its cap", self.id));
            }
        }
        Ok(())
    }
}
