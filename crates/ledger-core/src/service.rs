//! Balance service
//!
//! Facade over the ledger. Every mutating operation follows one path:
//!
//! ```text
//! lock(customer) ─► load grants ─► lazy reset ─► resolve ─► deduct / credit
//!      ─► freshness check ─► commit (versioned) ─► invalidate cache ─► unlock
//!      ─► threshold crossed? ─► enqueue AutoTopup
//! ```
//!
//! A stale snapshot (a touched grant or bucket expired mid-operation, or a
//! version conflict on commit) is re-resolved from scratch a bounded number
//! of times. Top-up purchases are never retried that way.

use async_trait::async_trait;
use ledger_common::{Clock, CustomerId, EntityId, FeatureId, GrantId, StoreError, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::batching::{BatchApplier, BatchKey, DeductionBatcher};
use crate::cache::{BalanceCache, BalanceView, CacheKey};
use crate::catalog::{relevant_features, FeatureCatalog, FeatureDefinition, RelevantFeature};
use crate::config::LedgerConfig;
use crate::coordinator::{Coordinator, LockKey};
use crate::deduction::{credit, deduct, CandidateDelta, CreditKind, OverageBehaviour};
use crate::error::{LedgerError, LedgerResult};
use crate::grant::EntitlementGrant;
use crate::jobs::{Job, JobHandler, JobQueue};
use crate::metrics::LedgerMetrics;
use crate::reset::{reset_due, ResetOutcome, ResetScheduler};
use crate::resolver::{read_balance, resolve, BalanceQuery, CandidateSource, FeatureBalance};
use crate::store::{is_topup_grant, DurableStore, GrantFilter, TopupRecord};
use crate::sync::{ConsistencySync, ReadMode};
use crate::topup::{AutoTopupConfig, PurchaseRequest, ReplenishmentExecutor, TopupOutcome};

/// External boundaries the service runs against
#[derive(Clone)]
pub struct LedgerDeps {
    pub store: Arc<dyn DurableStore>,
    pub catalog: Arc<dyn FeatureCatalog>,
    pub cache: Arc<dyn BalanceCache>,
    pub jobs: Arc<dyn JobQueue>,
    pub executor: Arc<dyn ReplenishmentExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// One usage event; a negative amount refunds usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    pub feature_id: FeatureId,
    pub amount: Decimal,
}

impl UsageEvent {
    pub fn new(customer_id: CustomerId, feature_id: FeatureId, amount: Decimal) -> Self {
        Self {
            customer_id,
            entity_id: None,
            feature_id,
            amount,
        }
    }

    /// Attribute the event to an entity
    pub fn for_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    fn batch_key(&self) -> BatchKey {
        BatchKey::new(self.customer_id.clone(), self.feature_id.clone(), self.entity_id.clone())
    }
}

/// Result of an applied usage event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackReceipt {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    pub feature_id: FeatureId,
    pub requested: Decimal,
    /// Applied amount; negative for a refund
    pub deducted: Decimal,
    pub overage: Decimal,
    /// Left unapplied under [`OverageBehaviour::Cap`]
    pub shortfall: Decimal,
    pub unlimited: bool,
    /// Feature balance visible to the event's scope afterwards
    pub balance: Decimal,
    /// Grants reset lazily by this operation
    pub resets: usize,
}

/// Balance credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    pub feature_id: FeatureId,
    pub amount: Decimal,
    pub kind: CreditKind,
}

/// Result of a credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReceipt {
    pub customer_id: CustomerId,
    pub entity_id: Option<EntityId>,
    pub feature_id: FeatureId,
    pub kind: CreditKind,
    pub requested: Decimal,
    pub credited: Decimal,
    /// Refund beyond recorded usage
    pub uncredited: Decimal,
    pub balance: Decimal,
    pub resets: usize,
}

/// Result of moving a balance to a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBalanceReceipt {
    pub feature_id: FeatureId,
    pub previous: Decimal,
    pub target: Decimal,
    pub balance: Decimal,
}

/// Grants loaded under the lock, with due resets already applied
struct Snapshot {
    grants: Vec<EntitlementGrant>,
    resets: Vec<ResetOutcome>,
    now: Timestamp,
}

/// Per-request results of a locked batch plus the post-write balances of the
/// features it drew on
struct Applied {
    results: Vec<LedgerResult<TrackReceipt>>,
    levels: Vec<(FeatureId, Decimal)>,
}

/// Ledger facade
pub struct BalanceService {
    store: Arc<dyn DurableStore>,
    catalog: Arc<dyn FeatureCatalog>,
    jobs: Arc<dyn JobQueue>,
    executor: Arc<dyn ReplenishmentExecutor>,
    clock: Arc<dyn Clock>,
    coordinator: Arc<Coordinator>,
    sync: Arc<ConsistencySync>,
    scheduler: Arc<ResetScheduler>,
    config: LedgerConfig,
    metrics: Arc<LedgerMetrics>,
}

impl BalanceService {
    pub fn new(deps: LedgerDeps, config: LedgerConfig) -> Self {
        let metrics = Arc::new(LedgerMetrics::new());
        let coordinator = Arc::new(Coordinator::new(config.lock.clone(), Arc::clone(&metrics)));
        let sync = Arc::new(ConsistencySync::new(
            Arc::clone(&deps.store),
            deps.cache,
            Arc::clone(&deps.clock),
            Arc::clone(&metrics),
            &config.cache,
        ));
        let scheduler = Arc::new(ResetScheduler::new(
            Arc::clone(&deps.store),
            Arc::clone(&coordinator),
            Arc::clone(&sync),
            Arc::clone(&deps.clock),
            config.reset.clone(),
            Arc::clone(&metrics),
        ));
        Self {
            store: deps.store,
            catalog: deps.catalog,
            jobs: deps.jobs,
            executor: deps.executor,
            clock: deps.clock,
            coordinator,
            sync,
            scheduler,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    pub fn sync(&self) -> &Arc<ConsistencySync> {
        &self.sync
    }

    pub fn scheduler(&self) -> &Arc<ResetScheduler> {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Spawn a batching stage in front of this service
    pub fn start_batcher(self: &Arc<Self>) -> (DeductionBatcher, tokio::task::JoinHandle<()>) {
        let applier: Arc<dyn BatchApplier> = Arc::clone(self) as Arc<dyn BatchApplier>;
        DeductionBatcher::start(applier, self.config.batching.clone(), Arc::clone(&self.metrics))
    }

    /// Apply one usage event
    ///
    /// Fails closed: lock contention and insufficient balance are returned
    /// to the caller, never dropped.
    #[instrument(skip_all, fields(customer = %event.customer_id, feature = %event.feature_id, amount = %event.amount))]
    pub async fn track(&self, event: UsageEvent) -> LedgerResult<TrackReceipt> {
        let key = event.batch_key();
        let mut results = self.apply_serialized(&key, &[event.amount]).await?;
        results
            .pop()
            .unwrap_or_else(|| Err(LedgerError::Unavailable("usage event produced no result".into())))
    }

    /// Credit a feature balance
    #[instrument(skip_all, fields(customer = %request.customer_id, feature = %request.feature_id, amount = %request.amount))]
    pub async fn credit(&self, request: CreditRequest) -> LedgerResult<CreditReceipt> {
        if request.amount <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "credit amount must be positive, got {}",
                request.amount
            )));
        }
        let _guard = self
            .coordinator
            .acquire(LockKey::scoped(request.customer_id.clone(), request.entity_id.clone()))
            .await?;
        self.with_retries(|| self.credit_locked(&request)).await
    }

    /// Move a feature balance to `target` by deducting or crediting the difference
    #[instrument(skip_all, fields(customer = %customer_id, feature = %feature_id, target = %target))]
    pub async fn set_balance(
        &self,
        customer_id: &CustomerId,
        entity_id: Option<&EntityId>,
        feature_id: &FeatureId,
        target: Decimal,
    ) -> LedgerResult<SetBalanceReceipt> {
        if target < Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!("target balance must not be negative, got {target}")));
        }
        let _guard = self
            .coordinator
            .acquire(LockKey::scoped(customer_id.clone(), entity_id.cloned()))
            .await?;
        self.with_retries(|| self.set_balance_locked(customer_id, entity_id, feature_id, target))
            .await
    }

    /// Balance breakdown of one feature
    pub async fn balance(
        &self,
        customer_id: &CustomerId,
        entity_id: Option<&EntityId>,
        feature_id: &FeatureId,
        mode: ReadMode,
    ) -> LedgerResult<FeatureBalance> {
        let view = self.balances(customer_id, entity_id, mode).await?;
        Ok(view
            .feature(feature_id)
            .cloned()
            .unwrap_or_else(|| FeatureBalance::empty(feature_id.clone(), entity_id.cloned())))
    }

    /// Every feature balance of a customer or entity
    pub async fn balances(
        &self,
        customer_id: &CustomerId,
        entity_id: Option<&EntityId>,
        mode: ReadMode,
    ) -> LedgerResult<Arc<BalanceView>> {
        self.sync
            .read(&CacheKey::new(customer_id.clone(), entity_id.cloned()), mode)
            .await
    }

    /// Run one background job
    pub async fn handle_job(&self, job: Job) -> LedgerResult<()> {
        match job {
            Job::AutoTopup {
                customer_id,
                feature_id,
                attempt,
            } => {
                self.run_topup(&customer_id, &feature_id, attempt).await?;
            }
            Job::ResetSweep => {
                self.scheduler.sweep().await?;
            }
        }
        Ok(())
    }

    /// Top up a feature if its balance is still at or below the threshold
    #[instrument(skip_all, fields(customer = %customer_id, feature = %feature_id, attempt = attempt))]
    pub async fn run_topup(
        &self,
        customer_id: &CustomerId,
        feature_id: &FeatureId,
        attempt: u32,
    ) -> LedgerResult<TopupOutcome> {
        let Some(config) = self
            .catalog
            .auto_topup(customer_id, feature_id)
            .await
            .filter(|c| c.enabled)
        else {
            self.metrics.topups_skipped.inc();
            debug!("auto top-up disabled");
            return Ok(TopupOutcome::Disabled);
        };

        let _guard = match self.coordinator.acquire(LockKey::customer(customer_id.clone())).await {
            Ok(guard) => guard,
            Err(LedgerError::LockContention { .. }) => return self.requeue_topup(customer_id, feature_id, attempt).await,
            Err(e) => return Err(e),
        };
        self.topup_locked(customer_id, &config).await
    }

    async fn requeue_topup(
        &self,
        customer_id: &CustomerId,
        feature_id: &FeatureId,
        attempt: u32,
    ) -> LedgerResult<TopupOutcome> {
        if attempt >= self.config.topup.max_requeues {
            self.metrics.topups_skipped.inc();
            warn!(attempt, "dropping auto top-up after repeated lock contention");
            return Ok(TopupOutcome::Deferred { requeued: false });
        }
        let delay = self
            .config
            .topup
            .requeue_delay()
            .saturating_mul(1 << attempt.min(10));
        let job = Job::AutoTopup {
            customer_id: customer_id.clone(),
            feature_id: feature_id.clone(),
            attempt: attempt + 1,
        };
        self.jobs.enqueue(job, delay).await?;
        warn!(attempt, delay_ms = delay.as_millis() as u64, "auto top-up requeued after lock contention");
        Ok(TopupOutcome::Deferred { requeued: true })
    }

    async fn topup_locked(&self, customer_id: &CustomerId, config: &AutoTopupConfig) -> LedgerResult<TopupOutcome> {
        let feature_id = &config.feature_id;
        let mut snapshot = self.load_snapshot(customer_id, [feature_id.clone()], None).await?;
        let query = BalanceQuery::new(customer_id.clone(), feature_id.clone(), None);

        // a failed credit leaves versions and credited top-ups as they were,
        // so the retry lands on the same key and finds the paid purchase
        let version: u64 = snapshot.grants.iter().map(|g| g.version).sum();
        let credited = snapshot.grants.iter().filter(|g| is_topup_grant(g)).count();
        let idempotency_key = format!("topup/{customer_id}/{feature_id}/{version}/{credited}");
        let pending = self
            .store
            .find_topup(customer_id, &idempotency_key)
            .await?
            .filter(|record| {
                let attachment = record.attachment_id();
                !snapshot
                    .grants
                    .iter()
                    .any(|g| g.product_attachment_id.as_deref() == Some(attachment.as_str()))
            });

        let record = match pending {
            Some(record) => {
                info!(reference = %record.reference, "crediting recorded top-up purchase");
                record
            }
            None => match self.purchase_topup(customer_id, config, &snapshot, &query, idempotency_key).await? {
                Ok(record) => record,
                Err(outcome) => return Ok(outcome),
            },
        };

        let grant = EntitlementGrant::new(customer_id.clone(), feature_id.clone(), record.quantity, snapshot.now)
            .with_attachment(record.attachment_id());
        let touched = BTreeSet::from([grant.id]);
        snapshot.grants.push(grant);
        if let Err(e) = self.persist(customer_id, &snapshot, touched).await {
            self.metrics.topups_failed.inc();
            error!(
                error = %e,
                reference = %record.reference,
                key = %record.idempotency_key,
                "top-up purchased but not credited"
            );
            return Err(e);
        }
        self.metrics.topups_executed.inc();

        let balance = read_balance(&snapshot.grants, &query, snapshot.now).total();
        info!(
            quantity = %record.quantity,
            balance = %balance,
            reference = %record.reference,
            "auto top-up applied"
        );
        Ok(TopupOutcome::Replenished {
            quantity: record.quantity,
            balance,
        })
    }

    /// Buy and record a top-up, or say why none was bought
    async fn purchase_topup(
        &self,
        customer_id: &CustomerId,
        config: &AutoTopupConfig,
        snapshot: &Snapshot,
        query: &BalanceQuery,
        idempotency_key: String,
    ) -> LedgerResult<Result<TopupRecord, TopupOutcome>> {
        let feature_id = &config.feature_id;
        let balance = read_balance(&snapshot.grants, query, snapshot.now).total();
        if !config.should_trigger(balance) {
            self.persist(customer_id, snapshot, BTreeSet::new()).await?;
            self.metrics.topups_skipped.inc();
            debug!(balance = %balance, "balance recovered, skipping top-up");
            return Ok(Err(TopupOutcome::BalanceHealthy { balance }));
        }

        if let Some(limit) = &config.max_purchases {
            let since = limit
                .window_start(snapshot.now)?
                .unwrap_or(Timestamp::from_millis(i64::MIN));
            let purchases = self.store.topups_since(customer_id, feature_id, since).await?;
            if purchases >= limit.limit {
                self.persist(customer_id, snapshot, BTreeSet::new()).await?;
                self.metrics.topups_skipped.inc();
                info!(purchases, limit = limit.limit, "auto top-up purchase limit reached");
                return Ok(Err(TopupOutcome::LimitReached { purchases }));
            }
        }

        let relevant = [RelevantFeature::own(feature_id.clone())];
        if resolve(&snapshot.grants, query, &relevant, snapshot.now).candidates.is_empty() {
            return Err(LedgerError::NoEligibleGrant(feature_id.clone()));
        }

        let request = PurchaseRequest {
            customer_id: customer_id.clone(),
            feature_id: feature_id.clone(),
            quantity: config.quantity,
            idempotency_key,
        };
        let purchase = match self.executor.purchase(&request).await {
            Ok(purchase) => purchase,
            Err(e) => {
                self.persist(customer_id, snapshot, BTreeSet::new()).await?;
                self.metrics.topups_failed.inc();
                warn!(error = %e, "auto top-up purchase failed");
                return Ok(Err(TopupOutcome::PurchaseFailed { reason: e.to_string() }));
            }
        };

        let record = TopupRecord {
            customer_id: customer_id.clone(),
            feature_id: feature_id.clone(),
            at: snapshot.now,
            idempotency_key: request.idempotency_key,
            reference: purchase.reference,
            quantity: purchase.quantity,
        };
        if !self.store.record_topup(record.clone()).await? {
            debug!(key = %record.idempotency_key, "top-up purchase already recorded");
        }
        Ok(Ok(record))
    }

    /// Lock, apply and schedule top-ups for a run of amounts under one key
    async fn apply_serialized(&self, key: &BatchKey, amounts: &[Decimal]) -> LedgerResult<Vec<LedgerResult<TrackReceipt>>> {
        let applied = {
            let _guard = self
                .coordinator
                .acquire(LockKey::scoped(key.customer_id.clone(), key.entity_id.clone()))
                .await?;
            self.with_retries(|| self.apply_locked(key, amounts)).await?
        };
        self.schedule_topups(&key.customer_id, applied.levels).await;
        Ok(applied.results)
    }

    /// Apply amounts in order against one snapshot and commit once
    ///
    /// Under [`OverageBehaviour::Reject`] the first amount that cannot be
    /// covered fails without touching the snapshot, and so does every amount
    /// after it.
    async fn apply_locked(&self, key: &BatchKey, amounts: &[Decimal]) -> LedgerResult<Applied> {
        let feature = self.deductible_feature(&key.feature_id, key.entity_id.as_ref()).await?;
        let relevant = relevant_features(self.catalog.as_ref(), &feature).await;
        let mut snapshot = self
            .load_snapshot(
                &key.customer_id,
                relevant.iter().map(|r| r.feature_id.clone()),
                key.entity_id.clone(),
            )
            .await?;
        let query = BalanceQuery::new(key.customer_id.clone(), key.feature_id.clone(), key.entity_id.clone());

        let mut results = Vec::with_capacity(amounts.len());
        let mut deltas: Vec<CandidateDelta> = Vec::new();
        let mut exhausted: Option<LedgerError> = None;

        for &amount in amounts {
            if let Some(err) = &exhausted {
                results.push(Err(err.clone()));
                continue;
            }
            if amount.is_zero() {
                results.push(Err(LedgerError::InvalidAmount("usage amount must be non-zero".into())));
                continue;
            }
            let resolution = resolve(&snapshot.grants, &query, &relevant, snapshot.now);

            let receipt = |grants: &[EntitlementGrant], deducted, overage, shortfall| TrackReceipt {
                customer_id: key.customer_id.clone(),
                entity_id: key.entity_id.clone(),
                feature_id: key.feature_id.clone(),
                requested: amount,
                deducted,
                overage,
                shortfall,
                unlimited: resolution.unlimited,
                balance: read_balance(grants, &query, snapshot.now).total(),
                resets: snapshot.resets.len(),
            };

            if amount < Decimal::ZERO {
                if resolution.credit_targets(&snapshot.grants).is_empty() {
                    results.push(Err(LedgerError::NoEligibleGrant(key.feature_id.clone())));
                    continue;
                }
                let mut working = snapshot.grants.clone();
                let outcome = match credit(&mut working, &resolution, -amount, CreditKind::Refund) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        results.push(Err(e));
                        continue;
                    }
                };
                snapshot.grants = working;
                self.metrics.credits.inc();
                deltas.extend(outcome.deltas.iter().cloned());
                results.push(Ok(receipt(&snapshot.grants, -outcome.credited, Decimal::ZERO, Decimal::ZERO)));
                continue;
            }

            if resolution.unlimited {
                self.metrics.deductions.inc();
                results.push(Ok(receipt(&snapshot.grants, amount, Decimal::ZERO, Decimal::ZERO)));
                continue;
            }

            let mut working = snapshot.grants.clone();
            let outcome = match deduct(&mut working, &resolution, amount, resolution.allows_overage()) {
                Ok(outcome) => outcome,
                Err(e) => {
                    results.push(Err(e));
                    continue;
                }
            };
            if !outcome.is_complete() {
                self.metrics.shortfalls.inc();
                if self.config.deduction.overage == OverageBehaviour::Reject {
                    debug!(requested = %amount, available = %outcome.deducted, "rejecting deduction");
                    let err = LedgerError::InsufficientBalance {
                        feature_id: key.feature_id.clone(),
                        requested: amount,
                        available: outcome.deducted,
                    };
                    results.push(Err(err.clone()));
                    exhausted = Some(err);
                    continue;
                }
            }
            snapshot.grants = working;
            self.metrics.deductions.inc();
            if outcome.overage > Decimal::ZERO {
                self.metrics.overages.inc();
            }
            results.push(Ok(receipt(&snapshot.grants, outcome.deducted, outcome.overage, outcome.shortfall)));
            deltas.extend(outcome.deltas);
        }

        self.ensure_fresh(&snapshot.grants, &deltas)?;
        if !deltas.is_empty() {
            self.recheck_feature(&feature).await?;
        }

        let touched: BTreeSet<GrantId> = deltas.iter().map(|d| d.grant_id).collect();
        let drawn: BTreeSet<FeatureId> = snapshot
            .grants
            .iter()
            .filter(|g| deltas.iter().any(|d| d.grant_id == g.id && d.amount > Decimal::ZERO))
            .map(|g| g.feature_id.clone())
            .collect();
        self.persist(&key.customer_id, &snapshot, touched).await?;

        let levels = drawn
            .into_iter()
            .map(|feature_id| {
                let query = BalanceQuery::new(key.customer_id.clone(), feature_id.clone(), None);
                let level = read_balance(&snapshot.grants, &query, snapshot.now).total();
                (feature_id, level)
            })
            .collect();
        Ok(Applied { results, levels })
    }

    async fn credit_locked(&self, request: &CreditRequest) -> LedgerResult<CreditReceipt> {
        self.deductible_feature(&request.feature_id, request.entity_id.as_ref()).await?;
        let mut snapshot = self
            .load_snapshot(
                &request.customer_id,
                [request.feature_id.clone()],
                request.entity_id.clone(),
            )
            .await?;
        let query = BalanceQuery::new(
            request.customer_id.clone(),
            request.feature_id.clone(),
            request.entity_id.clone(),
        );
        let relevant = [RelevantFeature::own(request.feature_id.clone())];
        let resolution = resolve(&snapshot.grants, &query, &relevant, snapshot.now);
        if resolution.credit_targets(&snapshot.grants).is_empty() {
            self.persist(&request.customer_id, &snapshot, BTreeSet::new()).await?;
            return Err(LedgerError::NoEligibleGrant(request.feature_id.clone()));
        }

        let outcome = credit(&mut snapshot.grants, &resolution, request.amount, request.kind)?;
        self.ensure_fresh(&snapshot.grants, &outcome.deltas)?;
        self.persist(&request.customer_id, &snapshot, outcome.touched()).await?;
        self.metrics.credits.inc();

        Ok(CreditReceipt {
            customer_id: request.customer_id.clone(),
            entity_id: request.entity_id.clone(),
            feature_id: request.feature_id.clone(),
            kind: request.kind,
            requested: request.amount,
            credited: outcome.credited,
            uncredited: outcome.uncredited,
            balance: read_balance(&snapshot.grants, &query, snapshot.now).total(),
            resets: snapshot.resets.len(),
        })
    }

    async fn set_balance_locked(
        &self,
        customer_id: &CustomerId,
        entity_id: Option<&EntityId>,
        feature_id: &FeatureId,
        target: Decimal,
    ) -> LedgerResult<SetBalanceReceipt> {
        self.deductible_feature(feature_id, entity_id).await?;
        let mut snapshot = self
            .load_snapshot(customer_id, [feature_id.clone()], entity_id.cloned())
            .await?;
        let query = BalanceQuery::new(customer_id.clone(), feature_id.clone(), entity_id.cloned());
        let relevant = [RelevantFeature::own(feature_id.clone())];
        let resolution = resolve(&snapshot.grants, &query, &relevant, snapshot.now);
        if resolution.unlimited {
            return Err(LedgerError::ConfigInconsistency(format!(
                "feature {feature_id} is unlimited and has no balance to set"
            )));
        }

        // only balances this scope can draw on; other entities' grants stay put
        let previous = resolution.net_balance();
        let diff = target - previous;
        let deltas = if diff > Decimal::ZERO {
            if resolution.credit_targets(&snapshot.grants).is_empty() {
                return Err(LedgerError::NoEligibleGrant(feature_id.clone()));
            }
            credit(&mut snapshot.grants, &resolution, diff, CreditKind::Adjustment)?.deltas
        } else if diff < Decimal::ZERO {
            let outcome = deduct(&mut snapshot.grants, &resolution, -diff, false)?;
            if !outcome.is_complete() {
                return Err(LedgerError::InsufficientBalance {
                    feature_id: feature_id.clone(),
                    requested: -diff,
                    available: outcome.deducted,
                });
            }
            outcome.deltas
        } else {
            Vec::new()
        };

        self.ensure_fresh(&snapshot.grants, &deltas)?;
        let touched = deltas.iter().map(|d| d.grant_id).collect();
        self.persist(customer_id, &snapshot, touched).await?;
        let balance = resolve(&snapshot.grants, &query, &relevant, snapshot.now).net_balance();
        info!(previous = %previous, balance = %balance, "balance set");
        Ok(SetBalanceReceipt {
            feature_id: feature_id.clone(),
            previous,
            target,
            balance,
        })
    }

    /// Load a customer's grants, verify them and apply due resets in memory
    async fn load_snapshot(
        &self,
        customer_id: &CustomerId,
        features: impl IntoIterator<Item = FeatureId>,
        entity_id: Option<EntityId>,
    ) -> LedgerResult<Snapshot> {
        let now = self.clock.now();
        let filter = GrantFilter::features(features).with_entity(entity_id).active_at(now);
        let mut grants = self.store.load_grants(customer_id, &filter).await?;
        verify(customer_id, &grants)?;
        let resets = reset_due(&mut grants, now)?;
        Ok(Snapshot { grants, resets, now })
    }

    /// Commit touched and reset grants, then invalidate the cache
    async fn persist(&self, customer_id: &CustomerId, snapshot: &Snapshot, touched: BTreeSet<GrantId>) -> LedgerResult<()> {
        let mut ids = touched;
        ids.extend(snapshot.resets.iter().map(|r| r.grant_id));
        if ids.is_empty() {
            return Ok(());
        }
        let writes: Vec<EntitlementGrant> = snapshot
            .grants
            .iter()
            .filter(|g| ids.contains(&g.id))
            .cloned()
            .collect();
        verify(customer_id, &writes)?;
        self.store.commit(customer_id, writes).await?;

        if !snapshot.resets.is_empty() {
            self.metrics.resets.add(snapshot.resets.len() as u64);
            self.metrics
                .rollovers_created
                .add(snapshot.resets.iter().filter(|r| r.bucket_id.is_some()).count() as u64);
            for reset in &snapshot.resets {
                info!(
                    customer = %customer_id,
                    grant = %reset.grant_id,
                    carried = %reset.carried,
                    forfeited = %reset.forfeited,
                    "grant reset on access"
                );
            }
        }
        self.sync.after_commit(customer_id).await;
        Ok(())
    }

    /// Fail with `StaleGrant` if anything drawn on expired since the snapshot
    fn ensure_fresh(&self, grants: &[EntitlementGrant], deltas: &[CandidateDelta]) -> LedgerResult<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        for delta in deltas {
            let Some(grant) = grants.iter().find(|g| g.id == delta.grant_id) else {
                continue;
            };
            let stale = grant.is_expired(now)
                || match delta.source {
                    CandidateSource::Current => false,
                    CandidateSource::Rollover(bucket_id) => grant
                        .rollovers
                        .iter()
                        .find(|b| b.id == bucket_id)
                        .map_or(true, |b| b.is_expired(now)),
                };
            if stale {
                return Err(LedgerError::StaleGrant(grant.id));
            }
        }
        Ok(())
    }

    /// Catalog entry of a feature that can carry a balance in this scope
    async fn deductible_feature(&self, feature_id: &FeatureId, entity_id: Option<&EntityId>) -> LedgerResult<FeatureDefinition> {
        let feature = self
            .catalog
            .feature(feature_id)
            .await
            .ok_or_else(|| LedgerError::FeatureNotFound(feature_id.clone()))?;
        if !feature.is_deductible() {
            return Err(LedgerError::ConfigInconsistency(format!(
                "feature {feature_id} is boolean and has no balance"
            )));
        }
        if feature.entity_scoped && entity_id.is_none() {
            return Err(LedgerError::EntityRequired(feature_id.clone()));
        }
        Ok(feature)
    }

    /// The feature must still be what it was when the snapshot was resolved
    async fn recheck_feature(&self, resolved: &FeatureDefinition) -> LedgerResult<()> {
        match self.catalog.feature(&resolved.id).await {
            Some(current) if current.kind == resolved.kind => Ok(()),
            Some(current) => {
                warn!(feature = %resolved.id, "feature changed type mid-operation");
                Err(LedgerError::ConfigInconsistency(format!(
                    "feature {} changed from {:?} to {:?}",
                    resolved.id, resolved.kind, current.kind
                )))
            }
            None => Err(LedgerError::FeatureNotFound(resolved.id.clone())),
        }
    }

    /// Re-run `op` after a stale snapshot, up to `persist_retries` times
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e @ (LedgerError::StaleGrant(_) | LedgerError::Store(StoreError::Conflict(_))))
                    if attempt < self.config.deduction.persist_retries =>
                {
                    attempt += 1;
                    self.metrics.stale_retries.inc();
                    debug!(attempt, error = %e, "re-resolving after stale snapshot");
                }
                other => return other,
            }
        }
    }

    async fn schedule_topups(&self, customer_id: &CustomerId, levels: Vec<(FeatureId, Decimal)>) {
        for (feature_id, balance) in levels {
            let Some(config) = self.catalog.auto_topup(customer_id, &feature_id).await else {
                continue;
            };
            if !config.should_trigger(balance) {
                continue;
            }
            let job = Job::AutoTopup {
                customer_id: customer_id.clone(),
                feature_id: feature_id.clone(),
                attempt: 0,
            };
            match self.jobs.enqueue(job, Duration::ZERO).await {
                Ok(()) => {
                    self.metrics.topups_scheduled.inc();
                    debug!(customer = %customer_id, feature = %feature_id, balance = %balance, "auto top-up scheduled");
                }
                Err(e) => warn!(customer = %customer_id, feature = %feature_id, error = %e, "failed to schedule auto top-up"),
            }
        }
    }
}

fn verify(customer_id: &CustomerId, grants: &[EntitlementGrant]) -> LedgerResult<()> {
    for grant in grants {
        if let Err(reason) = grant.check_invariants() {
            error!(customer = %customer_id, grant = %grant.id, reason = %reason, "grant violates ledger invariants");
            return Err(LedgerError::Corruption(format!("grant {}: {reason}", grant.id)));
        }
    }
    Ok(())
}

#[async_trait]
impl BatchApplier for BalanceService {
    async fn apply_batch(&self, key: &BatchKey, amounts: Vec<Decimal>) -> Vec<LedgerResult<TrackReceipt>> {
        let count = amounts.len();
        match self.apply_serialized(key, &amounts).await {
            Ok(results) => results,
            Err(e) => vec![Err(e); count],
        }
    }
}

#[async_trait]
impl JobHandler for BalanceService {
    async fn handle(&self, job: Job) -> LedgerResult<()> {
        self.handle_job(job).await
    }
}

#[cfg(test)]
impl TrackReceipt {
    pub(crate) fn applied(key: &BatchKey, amount: Decimal) -> Self {
        Self {
            customer_id: key.customer_id.clone(),
            entity_id: key.entity_id.clone(),
            feature_id: key.feature_id.clone(),
            requested: amount,
            deducted: amount,
            overage: Decimal::ZERO,
            shortfall: Decimal::ZERO,
            unlimited: false,
            balance: Decimal::ZERO,
            resets: 0,
        }
    }
}
