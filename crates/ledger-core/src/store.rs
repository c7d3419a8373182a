//! Durable store boundary
//!
//! The store owns grant rows and the top-up purchase ledger. Every commit is
//! all-or-nothing and checks each grant's `version` against the stored one,
//! so a write based on a stale snapshot fails with [`StoreError::Conflict`].
//! A write at version 0 for a grant the store has never seen inserts it.
//!
//! Top-up purchases are keyed by their idempotency key: recording the same
//! key twice keeps the first record.

use async_trait::async_trait;
use ledger_common::{CustomerId, EntityId, FeatureId, GrantId, StoreError, StoreResult, Timestamp};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::grant::EntitlementGrant;

/// Which grants to load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GrantFilter {
    /// Only these features; `None` loads all
    pub features: Option<Vec<FeatureId>>,
    /// Customer-level grants plus grants owned by this entity; `None` loads all
    pub entity: Option<EntityId>,
    /// Skip grants already expired at this instant
    pub active_at: Option<Timestamp>,
}

impl GrantFilter {
    /// Every grant of the customer
    pub fn all() -> Self {
        Self::default()
    }

    /// Grants of the given features
    pub fn features(features: impl IntoIterator<Item = FeatureId>) -> Self {
        Self {
            features: Some(features.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Narrow to what an entity can see
    pub fn with_entity(mut self, entity: Option<EntityId>) -> Self {
        self.entity = entity;
        self
    }

    /// Skip expired grants
    pub fn active_at(mut self, now: Timestamp) -> Self {
        self.active_at = Some(now);
        self
    }

    /// Whether a grant passes the filter
    pub fn matches(&self, grant: &EntitlementGrant) -> bool {
        if let Some(features) = &self.features {
            if !features.contains(&grant.feature_id) {
                return false;
            }
        }
        if let (Some(entity), Some(owner)) = (&self.entity, &grant.entity_id) {
            if entity != owner {
                return false;
            }
        }
        match self.active_at {
            Some(now) => !grant.is_expired(now),
            None => true,
        }
    }
}

/// Durable grant storage
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Grants of a customer matching the filter
    async fn load_grants(&self, customer: &CustomerId, filter: &GrantFilter) -> StoreResult<Vec<EntitlementGrant>>;

    /// Add a new grant
    async fn insert_grant(&self, grant: EntitlementGrant) -> StoreResult<()>;

    /// Write changed grants atomically, returning them with bumped versions.
    /// Unknown grants at version 0 are inserted in the same commit.
    async fn commit(&self, customer: &CustomerId, writes: Vec<EntitlementGrant>) -> StoreResult<Vec<EntitlementGrant>>;

    /// Drop every grant created by a product attachment
    async fn remove_attachment(&self, customer: &CustomerId, attachment_id: &str) -> StoreResult<usize>;

    /// Customers owning at least one grant due for reset at `now`
    async fn due_for_reset(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<CustomerId>>;

    /// Record a paid top-up purchase; returns false when its key is already recorded
    async fn record_topup(&self, record: TopupRecord) -> StoreResult<bool>;

    /// Purchase recorded under an idempotency key
    async fn find_topup(&self, customer: &CustomerId, idempotency_key: &str) -> StoreResult<Option<TopupRecord>>;

    /// Top-up purchases recorded at or after `since`
    async fn topups_since(&self, customer: &CustomerId, feature: &FeatureId, since: Timestamp) -> StoreResult<u32>;
}

/// In-memory store
pub struct InMemoryStore {
    grants: RwLock<HashMap<CustomerId, BTreeMap<GrantId, EntitlementGrant>>>,
    topups: RwLock<HashMap<CustomerId, Vec<TopupRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            topups: RwLock::new(HashMap::new()),
        }
    }

    /// Store pre-loaded with grants
    pub fn with_grants(grants: impl IntoIterator<Item = EntitlementGrant>) -> Self {
        let store = Self::new();
        {
            let mut table = store.grants.write();
            for grant in grants {
                table
                    .entry(grant.customer_id.clone())
                    .or_default()
                    .insert(grant.id, grant);
            }
        }
        store
    }

    /// Every stored grant, ordered by customer then id
    pub fn export(&self) -> Vec<EntitlementGrant> {
        let table = self.grants.read();
        let mut customers: Vec<_> = table.keys().cloned().collect();
        customers.sort();
        customers
            .iter()
            .filter_map(|c| table.get(c))
            .flat_map(|grants| grants.values().cloned())
            .collect()
    }

    /// Direct read of one grant
    pub fn grant(&self, customer: &CustomerId, id: &GrantId) -> Option<EntitlementGrant> {
        self.grants.read().get(customer).and_then(|g| g.get(id)).cloned()
    }

    /// Every recorded top-up purchase, oldest first per customer and feature
    pub fn topup_log(&self) -> Vec<TopupRecord> {
        let mut log: Vec<TopupRecord> = self.topups.read().values().flatten().cloned().collect();
        log.sort_by(|a, b| {
            (&a.customer_id, &a.feature_id, a.at).cmp(&(&b.customer_id, &b.feature_id, b.at))
        });
        log
    }
}

/// One paid top-up purchase in the store's ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopupRecord {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    pub at: Timestamp,
    /// Key the purchase was made under
    #[serde(default)]
    pub idempotency_key: String,
    /// Processor reference of the charge
    #[serde(default)]
    pub reference: String,
    /// Units bought
    #[serde(default)]
    pub quantity: Decimal,
}

const TOPUP_ATTACHMENT: &str = "topup:";

impl TopupRecord {
    /// Attachment id carried by the grant that credits this purchase
    pub fn attachment_id(&self) -> String {
        format!("{TOPUP_ATTACHMENT}{}", self.idempotency_key)
    }
}

/// Whether a grant credits a top-up purchase
pub fn is_topup_grant(grant: &EntitlementGrant) -> bool {
    grant
        .product_attachment_id
        .as_deref()
        .is_some_and(|id| id.starts_with(TOPUP_ATTACHMENT))
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn load_grants(&self, customer: &CustomerId, filter: &GrantFilter) -> StoreResult<Vec<EntitlementGrant>> {
        Ok(self
            .grants
            .read()
            .get(customer)
            .map(|grants| grants.values().filter(|g| filter.matches(g)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_grant(&self, grant: EntitlementGrant) -> StoreResult<()> {
        let mut table = self.grants.write();
        let grants = table.entry(grant.customer_id.clone()).or_default();
        if grants.contains_key(&grant.id) {
            return Err(StoreError::Conflict(format!("grant {} already exists", grant.id)));
        }
        grants.insert(grant.id, grant);
        Ok(())
    }

    async fn commit(&self, customer: &CustomerId, writes: Vec<EntitlementGrant>) -> StoreResult<Vec<EntitlementGrant>> {
        let mut table = self.grants.write();
        let grants = table.entry(customer.clone()).or_default();

        for write in &writes {
            if write.customer_id != *customer {
                return Err(StoreError::Conflict(format!("grant {} belongs to another customer", write.id)));
            }
            let stored_version = match grants.get(&write.id) {
                Some(stored) => stored.version,
                None if write.version == 0 => 0,
                None => return Err(StoreError::NotFound(write.id.to_string())),
            };
            if stored_version != write.version {
                return Err(StoreError::Conflict(format!(
                    "grant {} is at version {}, write expected {}",
                    write.id, stored_version, write.version
                )));
            }
        }

        let committed: Vec<EntitlementGrant> = writes
            .into_iter()
            .map(|mut grant| {
                grant.version += 1;
                grant
            })
            .collect();
        for grant in &committed {
            grants.insert(grant.id, grant.clone());
        }
        Ok(committed)
    }

    async fn remove_attachment(&self, customer: &CustomerId, attachment_id: &str) -> StoreResult<usize> {
        let mut table = self.grants.write();
        let Some(grants) = table.get_mut(customer) else {
            return Ok(0);
        };
        let before = grants.len();
        grants.retain(|_, g| g.product_attachment_id.as_deref() != Some(attachment_id));
        Ok(before - grants.len())
    }

    async fn due_for_reset(&self, now: Timestamp, limit: usize) -> StoreResult<Vec<CustomerId>> {
        let mut due: Vec<CustomerId> = self
            .grants
            .read()
            .iter()
            .filter(|(_, grants)| grants.values().any(|g| g.is_due(now)))
            .map(|(customer, _)| customer.clone())
            .collect();
        due.sort();
        due.truncate(limit);
        Ok(due)
    }

    async fn record_topup(&self, record: TopupRecord) -> StoreResult<bool> {
        let mut topups = self.topups.write();
        let records = topups.entry(record.customer_id.clone()).or_default();
        if records.iter().any(|r| r.idempotency_key == record.idempotency_key) {
            return Ok(false);
        }
        records.push(record);
        Ok(true)
    }

    async fn find_topup(&self, customer: &CustomerId, idempotency_key: &str) -> StoreResult<Option<TopupRecord>> {
        Ok(self
            .topups
            .read()
            .get(customer)
            .and_then(|records| records.iter().find(|r| r.idempotency_key == idempotency_key))
            .cloned())
    }

    async fn topups_since(&self, customer: &CustomerId, feature: &FeatureId, since: Timestamp) -> StoreResult<u32> {
        let count = self.topups.read().get(customer).map_or(0, |records| {
            records
                .iter()
                .filter(|r| r.feature_id == *feature && r.at >= since)
                .count()
        });
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::tests::{cus, ent, feat, grant, JAN_1};
    use crate::grant::Interval;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_commit_bumps_version_and_rejects_stale_writes() {
        let g = grant(dec!(10));
        let store = InMemoryStore::with_grants([g.clone()]);

        let mut write = g.clone();
        write.current_balance = dec!(5);
        write.usage = dec!(5);
        let committed = store.commit(&cus(), vec![write]).await.unwrap();
        assert_eq!(committed[0].version, 1);

        let mut stale = g.clone();
        stale.current_balance = dec!(1);
        stale.usage = dec!(9);
        let err = store.commit(&cus(), vec![stale]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.grant(&cus(), &g.id).unwrap().current_balance, dec!(5));
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let a = grant(dec!(10));
        let b = grant(dec!(20));
        let store = InMemoryStore::with_grants([a.clone(), b.clone()]);
        let mut b_stale = b.clone();
        b_stale.version = 7;
        let mut a_write = a.clone();
        a_write.current_balance = dec!(0);
        a_write.usage = dec!(10);
        assert!(store.commit(&cus(), vec![a_write, b_stale]).await.is_err());
        assert_eq!(store.grant(&cus(), &a.id).unwrap().current_balance, dec!(10));
    }

    #[tokio::test]
    async fn test_filters() {
        let messages = grant(dec!(10));
        let mut seats = grant(dec!(1)).for_entity(ent("seat_b"));
        seats.feature_id = feat("seats");
        let expired = grant(dec!(3)).with_expiry(Timestamp::from_millis(JAN_1));
        let store = InMemoryStore::with_grants([messages.clone(), seats, expired]);

        let loaded = store
            .load_grants(&cus(), &GrantFilter::features([feat("messages")]).active_at(Timestamp::from_millis(JAN_1)))
            .await
            .unwrap();
        assert_eq!(loaded, vec![messages]);

        let for_a = store
            .load_grants(&cus(), &GrantFilter::all().with_entity(Some(ent("seat_a"))))
            .await
            .unwrap();
        assert_eq!(for_a.len(), 2);
    }

    #[tokio::test]
    async fn test_due_for_reset_and_attachment_removal() {
        let due = grant(dec!(10))
            .with_reset(Interval::Month, 1, Timestamp::from_millis(JAN_1))
            .with_attachment("att_1");
        let store = InMemoryStore::with_grants([due, grant(dec!(1))]);
        let now = Timestamp::from_millis(JAN_1 + 1);
        assert_eq!(store.due_for_reset(now, 10).await.unwrap(), vec![cus()]);
        assert!(store.due_for_reset(now, 0).await.unwrap().is_empty());

        assert_eq!(store.remove_attachment(&cus(), "att_1").await.unwrap(), 1);
        assert!(store.due_for_reset(now, 10).await.unwrap().is_empty());
        assert_eq!(store.export().len(), 1);
    }

    fn purchase(key: &str, at: Timestamp) -> TopupRecord {
        TopupRecord {
            customer_id: cus(),
            feature_id: feat("messages"),
            at,
            idempotency_key: key.to_string(),
            reference: format!("ref_{key}"),
            quantity: dec!(50),
        }
    }

    #[tokio::test]
    async fn test_topup_ledger() {
        let store = InMemoryStore::new();
        let at = Timestamp::from_millis(JAN_1);
        assert!(store.record_topup(purchase("k1", at)).await.unwrap());
        assert!(store.record_topup(purchase("k2", at.add_millis(10))).await.unwrap());
        assert_eq!(store.topups_since(&cus(), &feat("messages"), at.add_millis(5)).await.unwrap(), 1);
        assert_eq!(store.topups_since(&cus(), &feat("credits"), at).await.unwrap(), 0);

        let log = store.topup_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].at, at);
    }

    #[tokio::test]
    async fn test_topup_record_is_idempotent_per_key() {
        let store = InMemoryStore::new();
        let at = Timestamp::from_millis(JAN_1);
        assert!(store.record_topup(purchase("k1", at)).await.unwrap());
        assert!(!store.record_topup(purchase("k1", at.add_millis(10))).await.unwrap());

        let found = store.find_topup(&cus(), "k1").await.unwrap().unwrap();
        assert_eq!(found.at, at);
        assert_eq!(found.attachment_id(), "topup:k1");
        assert!(store.find_topup(&cus(), "k2").await.unwrap().is_none());
        assert_eq!(store.topup_log().len(), 1);
    }

    #[tokio::test]
    async fn test_commit_inserts_new_grants_at_version_zero() {
        let existing = grant(dec!(10));
        let store = InMemoryStore::with_grants([existing.clone()]);
        let fresh = grant(dec!(5));
        let mut write = existing.clone();
        write.current_balance = dec!(4);
        write.usage = dec!(6);

        let committed = store.commit(&cus(), vec![write, fresh.clone()]).await.unwrap();
        assert_eq!(committed.len(), 2);
        assert_eq!(store.grant(&cus(), &fresh.id).unwrap().version, 1);

        // a second insert of the same grant is a stale write
        let err = store.commit(&cus(), vec![fresh.clone()]).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let mut unknown = grant(dec!(1));
        unknown.version = 3;
        let err = store.commit(&cus(), vec![unknown]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
