//! Concurrency coordinator
//!
//! Serializes mutating operations per customer. Entity-level keys map onto
//! their customer's mutex because an entity deduction can spill into
//! customer-level grants.
//!
//! Acquisition is bounded: `max_attempts` non-blocking tries separated by an
//! exponential backoff. The returned [`LockGuard`] releases on drop and
//! removes the customer's mutex from the table once nobody else holds it.

use dashmap::DashMap;
use ledger_common::{CustomerId, EntityId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::config::LockConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::LedgerMetrics;

/// What an operation needs exclusive access to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
}

impl LockKey {
    /// Whole customer
    pub fn customer(customer_id: CustomerId) -> Self {
        Self {
            customer_id,
            entity_id: None,
        }
    }

    /// Customer, optionally narrowed to an entity
    pub fn scoped(customer_id: CustomerId, entity_id: Option<EntityId>) -> Self {
        Self {
            customer_id,
            entity_id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_id {
            Some(entity) => write!(f, "{}/{}", self.customer_id, entity),
            None => write!(f, "{}", self.customer_id),
        }
    }
}

type LockTable = DashMap<CustomerId, Arc<Mutex<()>>>;

/// Held customer lock
pub struct LockGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl LockGuard {
    /// Key this guard was acquired for
    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key.customer_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Per-customer lock table
pub struct Coordinator {
    locks: Arc<LockTable>,
    config: LockConfig,
    metrics: Arc<LedgerMetrics>,
}

impl Coordinator {
    pub fn new(config: LockConfig, metrics: Arc<LedgerMetrics>) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            config,
            metrics,
        }
    }

    fn slot(&self, key: &LockKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.customer_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Single non-blocking attempt
    pub fn try_acquire(&self, key: &LockKey) -> Option<LockGuard> {
        let guard = self.slot(key).try_lock_owned().ok()?;
        Some(LockGuard {
            key: key.clone(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Acquire with bounded retries
    ///
    /// Returns [`LedgerError::LockContention`] once the attempts are spent.
    pub async fn acquire(&self, key: LockKey) -> LedgerResult<LockGuard> {
        let attempts = self.config.max_attempts.max(1);
        let mut backoff = self.config.initial_backoff();
        for attempt in 1..=attempts {
            if let Some(guard) = self.try_acquire(&key) {
                return Ok(guard);
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff());
            }
        }
        self.metrics.lock_contentions.inc();
        warn!(key = %key, attempts, "lock contention");
        Err(LedgerError::LockContention { key, attempts })
    }

    /// Customers with a live mutex
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no customer holds a mutex
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(LockConfig::default(), Arc::new(LedgerMetrics::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn cus(id: &str) -> CustomerId {
        CustomerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_guard_releases_and_prunes() {
        let coordinator = Coordinator::default();
        let guard = coordinator.acquire(LockKey::customer(cus("cus_1"))).await.unwrap();
        assert_eq!(coordinator.len(), 1);
        assert!(coordinator.try_acquire(&LockKey::customer(cus("cus_1"))).is_none());
        drop(guard);
        assert!(coordinator.is_empty());
        assert!(coordinator.try_acquire(&LockKey::customer(cus("cus_1"))).is_some());
    }

    #[tokio::test]
    async fn test_entity_keys_share_customer_lock() {
        let coordinator = Coordinator::default();
        let seat = LockKey::scoped(cus("cus_1"), Some(EntityId::new("seat_a").unwrap()));
        let _held = coordinator.try_acquire(&LockKey::customer(cus("cus_1"))).unwrap();
        assert!(coordinator.try_acquire(&seat).is_none());
        assert!(coordinator.try_acquire(&LockKey::customer(cus("cus_2"))).is_some());
        assert_eq!(seat.to_string(), "cus_1/seat_a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_after_bounded_attempts() {
        let metrics = Arc::new(LedgerMetrics::new());
        let config = LockConfig {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 15,
        };
        let coordinator = Coordinator::new(config, Arc::clone(&metrics));
        let _held = coordinator.acquire(LockKey::customer(cus("cus_1"))).await.unwrap();

        let err = coordinator
            .acquire(LockKey::customer(cus("cus_1")))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::LockContention { attempts: 3, .. }));
        assert!(err.is_retryable());
        assert_eq!(metrics.lock_contentions.get(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serializes_read_modify_write() {
        let coordinator = Arc::new(Coordinator::new(
            LockConfig {
                max_attempts: 1_000,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            Arc::new(LedgerMetrics::new()),
        ));
        let counter = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let _guard = coordinator.acquire(LockKey::customer(cus("cus_1"))).await.unwrap();
                    let seen = counter.load(Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    counter.store(seen + 1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 160);
        assert!(coordinator.is_empty());
    }
}
