//! Entitlement grants
//!
//! A grant is one allotment of a feature, owned by a customer (or by one of
//! its entities) and usually created by an attached product. Quantities obey
//!
//! ```text
//! current_balance = granted_balance + adjustment - usage
//! ```
//!
//! Per-entity grants keep the same four fields per entity slice, and the
//! top-level fields are always the field-wise sum of the slices.

use ledger_common::{CustomerId, DomainError, EntityId, FeatureId, GrantId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::rollover::{RolloverBucket, RolloverPolicy};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// Reset cadence of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    SemiAnnual,
    Year,
    /// Never resets
    Lifetime,
}

impl Interval {
    /// Whether grants with this interval ever reset
    pub fn resets(&self) -> bool {
        !matches!(self, Self::Lifetime)
    }

    fn fixed_millis(&self, count: u32) -> Option<i64> {
        let unit = match self {
            Self::Minute => MINUTE_MS,
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
            Self::Week => WEEK_MS,
            _ => return None,
        };
        Some(unit.saturating_mul(i64::from(count.max(1))))
    }

    fn months(&self, count: u32) -> Option<u32> {
        let unit = match self {
            Self::Month => 1,
            Self::Quarter => 3,
            Self::SemiAnnual => 6,
            Self::Year => 12,
            _ => return None,
        };
        Some(unit * count.max(1))
    }

    /// One step of `count` intervals forward from `from`
    pub fn advance(&self, from: Timestamp, count: u32) -> Result<Option<Timestamp>, DomainError> {
        if let Some(step) = self.fixed_millis(count) {
            return Ok(Some(from.add_millis(step)));
        }
        match self.months(count) {
            Some(months) => from.add_months(months).map(Some),
            None => Ok(None),
        }
    }

    /// One step of `count` intervals backward from `from`
    pub fn rewind(&self, from: Timestamp, count: u32) -> Result<Option<Timestamp>, DomainError> {
        if let Some(step) = self.fixed_millis(count) {
            return Ok(Some(from.add_millis(-step)));
        }
        match self.months(count) {
            Some(months) => from.sub_months(months).map(Some),
            None => Ok(None),
        }
    }

    /// First boundary strictly after `now`, stepping from `anchor`
    ///
    /// Returns `anchor` unchanged when it is already in the future.
    pub fn next_after(
        &self,
        anchor: Timestamp,
        count: u32,
        now: Timestamp,
    ) -> Result<Option<Timestamp>, DomainError> {
        if anchor > now {
            return Ok(Some(anchor));
        }
        if let Some(step) = self.fixed_millis(count) {
            let steps = (now.as_millis() - anchor.as_millis()) / step + 1;
            return Ok(Some(anchor.add_millis(steps.saturating_mul(step))));
        }
        let mut next = anchor;
        while next <= now {
            match self.advance(next, count)? {
                Some(n) => next = n,
                None => return Ok(None),
            }
        }
        Ok(Some(next))
    }
}

/// One entity's share of a per-entity grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySlice {
    pub granted: Decimal,
    pub balance: Decimal,
    pub usage: Decimal,
    #[serde(default)]
    pub adjustment: Decimal,
}

impl EntitySlice {
    /// Fresh slice holding a full allotment
    pub fn new(allotment: Decimal) -> Self {
        Self {
            granted: allotment,
            balance: allotment,
            usage: Decimal::ZERO,
            adjustment: Decimal::ZERO,
        }
    }

    /// `balance == granted + adjustment - usage`
    pub fn is_consistent(&self) -> bool {
        self.balance == self.granted + self.adjustment - self.usage
    }

    pub(crate) fn consume(&mut self, amount: Decimal) {
        self.balance -= amount;
        self.usage += amount;
    }

    pub(crate) fn restore(&mut self, amount: Decimal) {
        self.balance += amount;
        self.usage -= amount;
    }

    pub(crate) fn adjust(&mut self, amount: Decimal) {
        self.balance += amount;
        self.adjustment += amount;
    }
}

/// One allotment of a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementGrant {
    pub id: GrantId,
    pub customer_id: CustomerId,
    /// Set when the grant belongs to a single entity
    pub entity_id: Option<EntityId>,
    pub feature_id: FeatureId,
    /// Product attachment that created this grant, `None` for manual grants
    pub product_attachment_id: Option<String>,
    /// Amount restored at each reset (per slice for per-entity grants)
    pub allotment: Decimal,
    pub granted_balance: Decimal,
    pub current_balance: Decimal,
    pub usage: Decimal,
    #[serde(default)]
    pub adjustment: Decimal,
    pub interval: Interval,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
    pub next_reset_at: Option<Timestamp>,
    pub expires_at: Option<Timestamp>,
    #[serde(default)]
    pub unlimited: bool,
    /// Balance may go negative
    #[serde(default)]
    pub usage_allowed: bool,
    /// How far below zero overage may go
    pub usage_limit: Option<Decimal>,
    pub rollover: Option<RolloverPolicy>,
    #[serde(default)]
    pub(crate) entities: Option<BTreeMap<EntityId, EntitySlice>>,
    #[serde(default)]
    pub rollovers: Vec<RolloverBucket>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub version: u64,
}

fn default_interval_count() -> u32 {
    1
}

impl EntitlementGrant {
    /// New customer-level grant that never resets
    pub fn new(
        customer_id: CustomerId,
        feature_id: FeatureId,
        allotment: Decimal,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: GrantId::new_v4(),
            customer_id,
            entity_id: None,
            feature_id,
            product_attachment_id: None,
            allotment,
            granted_balance: allotment,
            current_balance: allotment,
            usage: Decimal::ZERO,
            adjustment: Decimal::ZERO,
            interval: Interval::Lifetime,
            interval_count: 1,
            next_reset_at: None,
            expires_at: None,
            unlimited: false,
            usage_allowed: false,
            usage_limit: None,
            rollover: None,
            entities: None,
            rollovers: Vec::new(),
            created_at,
            version: 0,
        }
    }

    /// Reset every `count` intervals, first at `next_reset_at`
    pub fn with_reset(mut self, interval: Interval, count: u32, next_reset_at: Timestamp) -> Self {
        self.interval = interval;
        self.interval_count = count.max(1);
        self.next_reset_at = interval.resets().then_some(next_reset_at);
        self
    }

    /// Inert from `at` onwards
    pub fn with_expiry(mut self, at: Timestamp) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Belongs to a single entity
    pub fn for_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    /// Created by a product attachment
    pub fn with_attachment(mut self, attachment_id: impl Into<String>) -> Self {
        self.product_attachment_id = Some(attachment_id.into());
        self
    }

    /// Allow overage, optionally bounded
    pub fn with_overage(mut self, usage_limit: Option<Decimal>) -> Self {
        self.usage_allowed = true;
        self.usage_limit = usage_limit;
        self
    }

    /// Carry unused balance into buckets at reset
    pub fn with_rollover(mut self, policy: RolloverPolicy) -> Self {
        self.rollover = Some(policy);
        self
    }

    /// Mark unlimited
    pub fn unlimited(mut self) -> Self {
        self.unlimited = true;
        self
    }

    /// Override id (fixtures and imports)
    pub fn with_id(mut self, id: GrantId) -> Self {
        self.id = id;
        self
    }

    /// Split into one full-allotment slice per entity
    pub fn per_entity(mut self, entities: impl IntoIterator<Item = EntityId>) -> Self {
        let slices = entities
            .into_iter()
            .map(|e| (e, EntitySlice::new(self.allotment)))
            .collect();
        self.entities = Some(slices);
        self.recompute_aggregate();
        self
    }

    /// Attach a rollover bucket
    pub fn push_rollover(&mut self, bucket: RolloverBucket) {
        self.rollovers.push(bucket);
    }

    /// Whether balances are tracked per entity
    pub fn is_per_entity(&self) -> bool {
        self.entities.is_some()
    }

    /// Per-entity slices, if any
    pub fn entity_slices(&self) -> Option<&BTreeMap<EntityId, EntitySlice>> {
        self.entities.as_ref()
    }

    /// One entity's slice
    pub fn entity_slice(&self, entity: &EntityId) -> Option<&EntitySlice> {
        self.entities.as_ref().and_then(|m| m.get(entity))
    }

    pub(crate) fn entity_slice_mut(&mut self, entity: &EntityId) -> Option<&mut EntitySlice> {
        self.entities.as_mut().and_then(|m| m.get_mut(entity))
    }

    pub(crate) fn entity_slices_mut(&mut self) -> Option<&mut BTreeMap<EntityId, EntitySlice>> {
        self.entities.as_mut()
    }

    /// Inert once `expires_at` has passed
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Reset boundary has been reached
    pub fn is_due(&self, now: Timestamp) -> bool {
        !self.is_expired(now) && self.next_reset_at.is_some_and(|at| at <= now)
    }

    /// Current-cycle balance for a scope
    ///
    /// `None` is the aggregate. A missing entity slice holds nothing.
    pub fn balance_for(&self, entity: Option<&EntityId>) -> Decimal {
        match (entity, &self.entities) {
            (Some(e), Some(slices)) => slices.get(e).map_or(Decimal::ZERO, |s| s.balance),
            _ => self.current_balance,
        }
    }

    /// Usage recorded for a scope
    pub fn usage_for(&self, entity: Option<&EntityId>) -> Decimal {
        match (entity, &self.entities) {
            (Some(e), Some(slices)) => slices.get(e).map_or(Decimal::ZERO, |s| s.usage),
            _ => self.usage,
        }
    }

    /// Unexpired buckets
    pub fn active_rollovers(&self, now: Timestamp) -> impl Iterator<Item = &RolloverBucket> {
        self.rollovers.iter().filter(move |b| !b.is_expired(now))
    }

    /// Current balance plus unexpired rollover balance for a scope
    pub fn available(&self, entity: Option<&EntityId>, now: Timestamp) -> Decimal {
        let carried: Decimal = self.active_rollovers(now).map(|b| b.balance_for(entity)).sum();
        self.balance_for(entity) + carried
    }

    /// Sequence number for the next bucket
    pub fn next_bucket_sequence(&self) -> u64 {
        self.rollovers.iter().map(|b| b.sequence + 1).max().unwrap_or(0)
    }

    /// Drop expired buckets, returning the balance they still held
    pub fn prune_expired_rollovers(&mut self, now: Timestamp) -> Decimal {
        let mut dropped = Decimal::ZERO;
        self.rollovers.retain(|b| {
            let expired = b.is_expired(now);
            if expired {
                dropped += b.balance;
            }
            !expired
        });
        dropped
    }

    /// Rebuild the top-level fields from the entity slices
    pub fn recompute_aggregate(&mut self) {
        let Some(slices) = &self.entities else {
            return;
        };
        let mut granted = Decimal::ZERO;
        let mut balance = Decimal::ZERO;
        let mut usage = Decimal::ZERO;
        let mut adjustment = Decimal::ZERO;
        for slice in slices.values() {
            granted += slice.granted;
            balance += slice.balance;
            usage += slice.usage;
            adjustment += slice.adjustment;
        }
        self.granted_balance = granted;
        self.current_balance = balance;
        self.usage = usage;
        self.adjustment = adjustment;
    }

    /// Check every stored invariant, describing the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.unlimited {
            return Ok(());
        }
        if self.granted_balance < Decimal::ZERO {
            return Err(format!("grant {} has negative granted balance", self.id));
        }
        if self.current_balance != self.granted_balance + self.adjustment - self.usage {
            return Err(format!("grant {} balance does not match granted + adjustment - usage", self.id));
        }
        if let Some(slices) = &self.entities {
            for (entity, slice) in slices {
                if slice.granted < Decimal::ZERO || !slice.is_consistent() {
                    return Err(format!("grant {} slice {} is inconsistent", self.id, entity));
                }
            }
            let sum: Decimal = slices.values().map(|s| s.balance).sum();
            if sum != self.current_balance {
                return Err(format!("grant {} aggregate differs from its entity slices", self.id));
            }
        }
        if let Some(limit) = self.usage_limit {
            let below = match &self.entities {
                Some(slices) => slices.values().any(|s| s.balance < -limit),
                None => self.current_balance < -limit,
            };
            if below {
                return Err(format!("grant {} is below its usage limit", self.id));
            }
        }
        for bucket in &self.rollovers {
            if bucket.grant_id != self.id {
                return Err(format!("bucket {} is attached to the wrong grant", bucket.id));
            }
            bucket.check_invariants()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    // 2024-01-01T00:00:00Z
    pub(crate) const JAN_1: i64 = 1_704_067_200_000;

    pub(crate) fn cus() -> CustomerId {
        CustomerId::new("cus_1").unwrap()
    }

    pub(crate) fn feat(id: &str) -> FeatureId {
        FeatureId::new(id).unwrap()
    }

    pub(crate) fn ent(id: &str) -> EntityId {
        EntityId::new(id).unwrap()
    }

    pub(crate) fn grant(allotment: Decimal) -> EntitlementGrant {
        EntitlementGrant::new(cus(), feat("messages"), allotment, Timestamp::from_millis(JAN_1))
    }

    #[test]
    fn test_new_grant_is_consistent() {
        let g = grant(dec!(100));
        assert_eq!(g.current_balance, dec!(100));
        assert!(g.check_invariants().is_ok());
        assert!(!g.is_due(Timestamp::from_millis(JAN_1 * 2)));
    }

    #[test]
    fn test_per_entity_aggregate() {
        let g = grant(dec!(50)).per_entity([ent("seat_a"), ent("seat_b")]);
        assert_eq!(g.granted_balance, dec!(100));
        assert_eq!(g.balance_for(Some(&ent("seat_a"))), dec!(50));
        assert_eq!(g.balance_for(Some(&ent("seat_z"))), Decimal::ZERO);
        assert!(g.check_invariants().is_ok());
    }

    #[test]
    fn test_broken_aggregate_is_reported() {
        let mut g = grant(dec!(50)).per_entity([ent("seat_a")]);
        g.current_balance = dec!(70);
        g.granted_balance = dec!(70);
        assert!(g.check_invariants().is_err());

        let mut g = grant(dec!(10));
        g.granted_balance = dec!(-1);
        assert!(g.check_invariants().is_err());
    }

    #[test]
    fn test_expiry_makes_grant_inert() {
        let g = grant(dec!(10))
            .with_reset(Interval::Month, 1, Timestamp::from_millis(JAN_1))
            .with_expiry(Timestamp::from_millis(JAN_1));
        assert!(g.is_expired(Timestamp::from_millis(JAN_1)));
        assert!(!g.is_due(Timestamp::from_millis(JAN_1 + 1)));
    }

    #[test]
    fn test_next_after_catches_up_in_whole_intervals() {
        let anchor = Timestamp::from_millis(JAN_1);
        let now = anchor.add_millis(3 * DAY_MS + 5);
        let next = Interval::Day.next_after(anchor, 1, now).unwrap().unwrap();
        assert_eq!(next, anchor.add_millis(4 * DAY_MS));

        let monthly = Interval::Month.next_after(anchor, 1, anchor).unwrap().unwrap();
        assert_eq!(monthly, anchor.add_months(1).unwrap());

        let future = anchor.add_millis(DAY_MS);
        assert_eq!(Interval::Week.next_after(future, 1, anchor).unwrap(), Some(future));
        assert_eq!(Interval::Lifetime.next_after(anchor, 1, now).unwrap(), None);
    }

    #[test]
    fn test_interval_rewind() {
        let at = Timestamp::from_millis(JAN_1);
        assert_eq!(Interval::Hour.rewind(at, 2).unwrap(), Some(at.add_millis(-2 * HOUR_MS)));
        assert_eq!(
            Interval::Quarter.rewind(at.add_months(3).unwrap(), 1).unwrap(),
            Some(at)
        );
    }

    #[test]
    fn test_grant_serde() {
        let g = grant(dec!(12.5)).per_entity([ent("seat_a")]);
        let json = serde_json::to_string(&g).unwrap();
        let back: EntitlementGrant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
    }
}
