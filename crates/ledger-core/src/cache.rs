//! Balance view cache
//!
//! Caches per customer/entity balance views for low-latency reads. The cache
//! never holds the truth: views are built from durable reads and dropped
//! wholesale whenever anything under the customer changes.
//!
//! Each customer maps to a generation number bumped by every invalidation. A
//! view is only kept if the generation it was built under is still current
//! after it lands, so a read racing a write cannot leave a pre-write view
//! behind. Generations live in a fixed set of stripes; customers sharing a
//! stripe only cost each other cache misses.

use async_trait::async_trait;
use ledger_common::{CustomerId, EntityId, FeatureId, Timestamp};
use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::resolver::FeatureBalance;

/// Cache key: a customer, or one of its entities
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
}

impl CacheKey {
    pub fn new(customer_id: CustomerId, entity_id: Option<EntityId>) -> Self {
        Self {
            customer_id,
            entity_id,
        }
    }
}

/// Every feature balance visible to a customer or entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceView {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    pub features: BTreeMap<FeatureId, FeatureBalance>,
    pub computed_at: Timestamp,
}

impl BalanceView {
    /// Balance of one feature
    pub fn feature(&self, id: &FeatureId) -> Option<&FeatureBalance> {
        self.features.get(id)
    }
}

/// Fast read cache
#[async_trait]
pub trait BalanceCache: Send + Sync {
    /// Cached view, if any
    async fn get(&self, key: &CacheKey) -> Option<Arc<BalanceView>>;

    /// Store a view built under `generation`; ignored if the customer has
    /// been invalidated since
    async fn set(&self, key: CacheKey, view: Arc<BalanceView>, generation: u64);

    /// Drop every view of the customer
    async fn invalidate_customer(&self, customer: &CustomerId);

    /// Current invalidation generation of a customer
    fn generation(&self, customer: &CustomerId) -> u64;
}

const GENERATION_STRIPES: usize = 1024;

type ScopeViews = RwLock<HashMap<Option<EntityId>, Arc<BalanceView>>>;

/// `moka`-backed cache holding every view of a customer under one entry
pub struct MokaBalanceCache {
    cache: Cache<CustomerId, Arc<ScopeViews>>,
    generations: Box<[AtomicU64]>,
}

impl MokaBalanceCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .build();
        Self {
            cache,
            generations: (0..GENERATION_STRIPES).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Approximate number of customers with cached views
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.cache.entry_count() == 0
    }

    fn stripe(&self, customer: &CustomerId) -> &AtomicU64 {
        let mut hasher = DefaultHasher::new();
        customer.hash(&mut hasher);
        &self.generations[hasher.finish() as usize % self.generations.len()]
    }
}

impl Default for MokaBalanceCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[async_trait]
impl BalanceCache for MokaBalanceCache {
    async fn get(&self, key: &CacheKey) -> Option<Arc<BalanceView>> {
        let views = self.cache.get(&key.customer_id).await?;
        let view = views.read().get(&key.entity_id).cloned();
        view
    }

    async fn set(&self, key: CacheKey, view: Arc<BalanceView>, generation: u64) {
        if self.generation(&key.customer_id) != generation {
            return;
        }
        let views = self
            .cache
            .get_with(key.customer_id.clone(), async { Arc::new(RwLock::new(HashMap::new())) })
            .await;
        views.write().insert(key.entity_id.clone(), view);
        // an invalidation that slipped in before the insert must still win
        if self.generation(&key.customer_id) != generation {
            self.cache.invalidate(&key.customer_id).await;
        }
    }

    async fn invalidate_customer(&self, customer: &CustomerId) {
        self.stripe(customer).fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(customer).await;
    }

    fn generation(&self, customer: &CustomerId) -> u64 {
        self.stripe(customer).load(Ordering::SeqCst)
    }
}
