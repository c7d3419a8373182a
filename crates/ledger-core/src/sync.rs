//! Consistency sync
//!
//! Moves the durable balance into the cache, never the reverse.
//!
//! ```text
//!  write path:  commit ─► invalidate all customer views ─► (spawn) rebuild customer view
//!  read path:   cache hit ─► view
//!               cache miss / skip-cache ─► durable read ─► view (stored only on miss)
//! ```

use ledger_common::{Clock, CustomerId, FeatureId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{BalanceCache, BalanceView, CacheKey};
use crate::config::CacheConfig;
use crate::error::LedgerResult;
use crate::metrics::LedgerMetrics;
use crate::reset::reset_due;
use crate::resolver::{read_balance, BalanceQuery};
use crate::store::{DurableStore, GrantFilter};

/// Where a read is served from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Cache first, durable store on miss
    #[default]
    Cached,
    /// Durable store only; the cache is neither read nor written
    SkipCache,
}

/// Difference between a cached and a durable feature balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    pub feature_id: FeatureId,
    pub cached: Option<Decimal>,
    pub durable: Option<Decimal>,
}

/// Cache maintenance driven by durable writes
#[derive(Clone)]
pub struct ConsistencySync {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn BalanceCache>,
    clock: Arc<dyn Clock>,
    metrics: Arc<LedgerMetrics>,
    refresh_after_write: bool,
}

impl ConsistencySync {
    pub fn new(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn BalanceCache>,
        clock: Arc<dyn Clock>,
        metrics: Arc<LedgerMetrics>,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            metrics,
            refresh_after_write: config.refresh_after_write,
        }
    }

    /// Balance view of a customer or entity
    pub async fn read(&self, key: &CacheKey, mode: ReadMode) -> LedgerResult<Arc<BalanceView>> {
        if mode == ReadMode::SkipCache {
            return Ok(Arc::new(self.durable_view(key).await?));
        }
        if let Some(view) = self.cache.get(key).await {
            self.metrics.cache_hits.inc();
            return Ok(view);
        }
        self.metrics.cache_misses.inc();
        let generation = self.cache.generation(&key.customer_id);
        let view = Arc::new(self.durable_view(key).await?);
        self.cache.set(key.clone(), Arc::clone(&view), generation).await;
        Ok(view)
    }

    /// Build a view straight from the durable store
    ///
    /// Due resets are applied to the loaded copy so a read never shows a
    /// finished cycle; nothing is written back.
    pub async fn durable_view(&self, key: &CacheKey) -> LedgerResult<BalanceView> {
        let now = self.clock.now();
        let filter = GrantFilter::all().with_entity(key.entity_id.clone()).active_at(now);
        let mut grants = self.store.load_grants(&key.customer_id, &filter).await?;
        reset_due(&mut grants, now)?;

        let features: BTreeSet<FeatureId> = grants.iter().map(|g| g.feature_id.clone()).collect();
        let features = features
            .into_iter()
            .map(|feature_id| {
                let query = BalanceQuery::new(key.customer_id.clone(), feature_id.clone(), key.entity_id.clone());
                (feature_id, read_balance(&grants, &query, now))
            })
            .collect();

        Ok(BalanceView {
            customer_id: key.customer_id.clone(),
            entity_id: key.entity_id.clone(),
            features,
            computed_at: now,
        })
    }

    /// Invalidate after a durable write under `customer`
    pub async fn after_commit(&self, customer: &CustomerId) {
        self.cache.invalidate_customer(customer).await;
        if !self.refresh_after_write {
            return;
        }
        let this = self.clone();
        let key = CacheKey::new(customer.clone(), None);
        tokio::spawn(async move {
            let generation = this.cache.generation(&key.customer_id);
            match this.durable_view(&key).await {
                Ok(view) => this.cache.set(key, Arc::new(view), generation).await,
                Err(e) => warn!(customer = %key.customer_id, error = %e, "cache refresh failed"),
            }
        });
    }

    /// Compare the cached view of `key` with a durable read
    ///
    /// Nothing cached means nothing can drift.
    pub async fn detect_drift(&self, key: &CacheKey) -> LedgerResult<Vec<Drift>> {
        let Some(cached) = self.cache.get(key).await else {
            return Ok(Vec::new());
        };
        let durable = self.durable_view(key).await?;

        let mut totals: BTreeMap<FeatureId, (Option<Decimal>, Option<Decimal>)> = BTreeMap::new();
        for (id, balance) in &cached.features {
            totals.entry(id.clone()).or_default().0 = Some(balance.total());
        }
        for (id, balance) in &durable.features {
            totals.entry(id.clone()).or_default().1 = Some(balance.total());
        }

        let drift: Vec<Drift> = totals
            .into_iter()
            .filter(|(_, (cached, durable))| cached != durable)
            .map(|(feature_id, (cached, durable))| Drift {
                feature_id,
                cached,
                durable,
            })
            .collect();
        if !drift.is_empty() {
            debug!(customer = %key.customer_id, features = drift.len(), "cache drift detected");
        }
        Ok(drift)
    }
}
