//! Cycle resets and rollover
//!
//! A due grant gets its allotment back for the new cycle. Unused balance is
//! carried into one new bucket (capped per entity slice) when the grant has a
//! rollover policy and forfeited otherwise. Per-entity grants go through the
//! same path once per slice.
//!
//! Resets happen in two places: lazily, on every locked operation that loads
//! the grants, and in the periodic [`ResetScheduler`] sweep. Both re-check
//! `next_reset_at` against `now` so applying a reset twice is a no-op.

use ledger_common::{BucketId, Clock, CustomerId, EntityId, GrantId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ResetConfig;
use crate::coordinator::{Coordinator, LockKey};
use crate::error::LedgerResult;
use crate::grant::{EntitlementGrant, EntitySlice};
use crate::metrics::LedgerMetrics;
use crate::rollover::RolloverBucket;
use crate::store::{DurableStore, GrantFilter};
use crate::sync::ConsistencySync;

/// Accounting of one grant reset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub grant_id: GrantId,
    pub previous_reset_at: Timestamp,
    pub next_reset_at: Option<Timestamp>,
    /// Moved into the new bucket
    pub carried: Decimal,
    /// Unused balance dropped
    pub forfeited: Decimal,
    /// Negative balance written off
    pub cleared_overage: Decimal,
    /// Balance still held by buckets that expired
    pub expired_rollover: Decimal,
    /// Allotment restored for the new cycle
    pub regranted: Decimal,
    pub bucket_id: Option<BucketId>,
}

/// Reset one grant if it is due at `now`
pub fn reset_grant(grant: &mut EntitlementGrant, now: Timestamp) -> LedgerResult<Option<ResetOutcome>> {
    if !grant.is_due(now) {
        return Ok(None);
    }
    let Some(previous) = grant.next_reset_at else {
        return Ok(None);
    };
    let next = grant.interval.next_after(previous, grant.interval_count, now)?;

    if grant.unlimited {
        grant.next_reset_at = next;
        return Ok(Some(ResetOutcome {
            grant_id: grant.id,
            previous_reset_at: previous,
            next_reset_at: next,
            carried: Decimal::ZERO,
            forfeited: Decimal::ZERO,
            cleared_overage: Decimal::ZERO,
            expired_rollover: Decimal::ZERO,
            regranted: Decimal::ZERO,
            bucket_id: None,
        }));
    }

    let expired_rollover = grant.prune_expired_rollovers(now);

    let scopes: Vec<Option<EntityId>> = match grant.entity_slices() {
        Some(slices) => slices.keys().cloned().map(Some).collect(),
        None => vec![None],
    };

    let mut carried_by_scope = BTreeMap::new();
    let mut carried = Decimal::ZERO;
    let mut forfeited = Decimal::ZERO;
    let mut cleared_overage = Decimal::ZERO;
    for scope in &scopes {
        let balance = grant.balance_for(scope.as_ref());
        let unused = balance.max(Decimal::ZERO);
        let carry = grant
            .rollover
            .as_ref()
            .map_or(Decimal::ZERO, |policy| policy.carry(unused));
        carried += carry;
        forfeited += unused - carry;
        cleared_overage += (-balance).max(Decimal::ZERO);
        if let Some(entity) = scope {
            carried_by_scope.insert(entity.clone(), carry);
        }
    }

    let mut bucket_id = None;
    if let Some(policy) = grant.rollover.as_ref().filter(|_| carried > Decimal::ZERO) {
        let bucket = RolloverBucket::new(
            grant.id,
            carried,
            policy.expiry_from(now)?,
            grant.next_bucket_sequence(),
            now,
        )
        .with_cap(policy.max);
        let bucket = if grant.is_per_entity() {
            bucket.with_entities(carried_by_scope)
        } else {
            bucket
        };
        bucket_id = Some(bucket.id);
        grant.push_rollover(bucket);
    }

    let allotment = grant.allotment;
    match grant.entity_slices_mut() {
        Some(slices) => {
            for slice in slices.values_mut() {
                *slice = EntitySlice::new(allotment);
            }
            grant.recompute_aggregate();
        }
        None => {
            grant.granted_balance = allotment;
            grant.current_balance = allotment;
            grant.usage = Decimal::ZERO;
            grant.adjustment = Decimal::ZERO;
        }
    }
    grant.next_reset_at = next;

    Ok(Some(ResetOutcome {
        grant_id: grant.id,
        previous_reset_at: previous,
        next_reset_at: next,
        carried,
        forfeited,
        cleared_overage,
        expired_rollover,
        regranted: allotment * Decimal::from(scopes.len()),
        bucket_id,
    }))
}

/// Reset every due grant in a snapshot
pub fn reset_due(grants: &mut [EntitlementGrant], now: Timestamp) -> LedgerResult<Vec<ResetOutcome>> {
    let mut outcomes = Vec::new();
    for grant in grants.iter_mut() {
        if let Some(outcome) = reset_grant(grant, now)? {
            debug!(
                grant = %outcome.grant_id,
                carried = %outcome.carried,
                forfeited = %outcome.forfeited,
                "grant reset"
            );
            outcomes.push(outcome);
        }
    }
    Ok(outcomes)
}

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub customers: usize,
    pub grants_reset: usize,
    pub rollovers_created: usize,
    /// Customers skipped because their lock was held
    pub skipped: usize,
    pub failed: usize,
}

/// Out-of-band reset sweep
pub struct ResetScheduler {
    store: Arc<dyn DurableStore>,
    coordinator: Arc<Coordinator>,
    sync: Arc<ConsistencySync>,
    clock: Arc<dyn Clock>,
    config: ResetConfig,
    metrics: Arc<LedgerMetrics>,
}

impl ResetScheduler {
    pub fn new(
        store: Arc<dyn DurableStore>,
        coordinator: Arc<Coordinator>,
        sync: Arc<ConsistencySync>,
        clock: Arc<dyn Clock>,
        config: ResetConfig,
        metrics: Arc<LedgerMetrics>,
    ) -> Self {
        Self {
            store,
            coordinator,
            sync,
            clock,
            config,
            metrics,
        }
    }

    /// Reset every customer with due grants, up to the batch limit
    ///
    /// A customer whose lock is held is skipped; the next sweep picks it up.
    pub async fn sweep(&self) -> LedgerResult<SweepReport> {
        let now = self.clock.now();
        let due = self.store.due_for_reset(now, self.config.batch_limit).await?;
        let mut report = SweepReport::default();

        for customer in due {
            report.customers += 1;
            let Some(_guard) = self.coordinator.try_acquire(&LockKey::customer(customer.clone())) else {
                self.metrics.lock_contentions.inc();
                debug!(customer = %customer, "customer locked, leaving reset to next sweep");
                report.skipped += 1;
                continue;
            };
            match self.reset_customer(&customer).await {
                Ok(outcomes) => {
                    report.grants_reset += outcomes.len();
                    report.rollovers_created += outcomes.iter().filter(|o| o.bucket_id.is_some()).count();
                }
                Err(e) => {
                    warn!(customer = %customer, error = %e, "reset failed");
                    report.failed += 1;
                }
            }
        }

        if report.grants_reset > 0 || report.failed > 0 {
            info!(
                customers = report.customers,
                grants = report.grants_reset,
                rollovers = report.rollovers_created,
                skipped = report.skipped,
                failed = report.failed,
                "reset sweep finished"
            );
        }
        Ok(report)
    }

    /// Reset one customer's due grants; the caller holds the customer lock
    async fn reset_customer(&self, customer: &CustomerId) -> LedgerResult<Vec<ResetOutcome>> {
        let now = self.clock.now();
        let mut grants = self.store.load_grants(customer, &GrantFilter::all()).await?;
        let outcomes = reset_due(&mut grants, now)?;
        if outcomes.is_empty() {
            return Ok(outcomes);
        }

        let writes: Vec<EntitlementGrant> = grants
            .into_iter()
            .filter(|g| outcomes.iter().any(|o| o.grant_id == g.id))
            .collect();
        self.store.commit(customer, writes).await?;
        self.sync.after_commit(customer).await;

        self.metrics.resets.add(outcomes.len() as u64);
        self.metrics
            .rollovers_created
            .add(outcomes.iter().filter(|o| o.bucket_id.is_some()).count() as u64);
        for outcome in &outcomes {
            info!(
                customer = %customer,
                grant = %outcome.grant_id,
                carried = %outcome.carried,
                forfeited = %outcome.forfeited,
                regranted = %outcome.regranted,
                "grant reset"
            );
        }
        Ok(outcomes)
    }

    /// Sweep forever at the configured period
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    warn!(error = %e, "reset sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::tests::{ent, grant, JAN_1};
    use crate::catalog::RelevantFeature;
    use crate::deduction::deduct;
    use crate::grant::Interval;
    use crate::resolver::{resolve, BalanceQuery};
    use crate::rollover::RolloverPolicy;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn at(ms: i64) -> Timestamp {
        Timestamp::from_millis(JAN_1 + ms)
    }

    fn monthly(allotment: Decimal) -> EntitlementGrant {
        grant(allotment).with_reset(Interval::Month, 1, at(0))
    }

    #[test]
    fn test_reset_restores_allotment_and_advances_from_previous() {
        let mut g = monthly(dec!(400));
        g.current_balance = dec!(150);
        g.usage = dec!(250);

        let outcome = reset_grant(&mut g, at(5_000)).unwrap().unwrap();
        assert_eq!(outcome.forfeited, dec!(150));
        assert_eq!(outcome.carried, dec!(0));
        assert_eq!(g.current_balance, dec!(400));
        assert_eq!(g.usage, dec!(0));
        assert_eq!(g.next_reset_at, Some(at(0).add_months(1).unwrap()));
        assert!(g.rollovers.is_empty());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut g = monthly(dec!(400)).with_rollover(RolloverPolicy::forever(None));
        g.current_balance = dec!(100);
        g.usage = dec!(300);

        assert!(reset_grant(&mut g, at(10)).unwrap().is_some());
        let after_first = g.clone();
        assert!(reset_grant(&mut g, at(10)).unwrap().is_none());
        assert_eq!(g, after_first);
        assert_eq!(g.rollovers.len(), 1);
    }

    #[test]
    fn test_rollover_capped_and_dated() {
        let mut g = monthly(dec!(400)).with_rollover(RolloverPolicy::monthly(Some(dec!(100)), 2));
        g.current_balance = dec!(250);
        g.usage = dec!(150);

        let outcome = reset_grant(&mut g, at(1)).unwrap().unwrap();
        assert_eq!(outcome.carried, dec!(100));
        assert_eq!(outcome.forfeited, dec!(150));
        let bucket = &g.rollovers[0];
        assert_eq!(bucket.balance, dec!(100));
        assert_eq!(bucket.cap, Some(dec!(100)));
        assert_eq!(bucket.expires_at, Some(at(1).add_months(2).unwrap()));
        assert!(g.check_invariants().is_ok());
    }

    #[test]
    fn test_missed_cycles_produce_one_bucket() {
        let mut g = grant(dec!(10))
            .with_reset(Interval::Day, 1, at(0))
            .with_rollover(RolloverPolicy::forever(None));
        let outcome = reset_grant(&mut g, at(3 * 86_400_000 + 1)).unwrap().unwrap();
        assert_eq!(outcome.next_reset_at, Some(at(4 * 86_400_000)));
        assert_eq!(g.rollovers.len(), 1);
        assert_eq!(g.rollovers[0].balance, dec!(10));
    }

    #[test]
    fn test_per_entity_reset_caps_each_slice() {
        let mut g = monthly(dec!(50))
            .per_entity([ent("seat_a"), ent("seat_b")])
            .with_rollover(RolloverPolicy::forever(Some(dec!(20))));
        if let Some(slice) = g.entity_slice_mut(&ent("seat_a")) {
            slice.consume(dec!(45));
        }
        g.recompute_aggregate();

        let outcome = reset_grant(&mut g, at(1)).unwrap().unwrap();
        // seat_a carries 5, seat_b carries min(50, 20)
        assert_eq!(outcome.carried, dec!(25));
        assert_eq!(outcome.forfeited, dec!(30));
        assert_eq!(outcome.regranted, dec!(100));
        let bucket = &g.rollovers[0];
        assert_eq!(bucket.balance_for(Some(&ent("seat_a"))), dec!(5));
        assert_eq!(bucket.balance_for(Some(&ent("seat_b"))), dec!(20));
        assert_eq!(g.current_balance, dec!(100));
        assert!(g.check_invariants().is_ok());
    }

    #[test]
    fn test_old_buckets_untouched_and_expired_dropped() {
        let mut g = monthly(dec!(10)).with_rollover(RolloverPolicy::forever(Some(dec!(5))));
        let keep = RolloverBucket::new(g.id, dec!(8), None, 0, at(-10)).with_cap(Some(dec!(8)));
        let gone = RolloverBucket::new(g.id, dec!(3), Some(at(0)), 1, at(-10));
        g.push_rollover(keep.clone());
        g.push_rollover(gone);

        let outcome = reset_grant(&mut g, at(1)).unwrap().unwrap();
        assert_eq!(outcome.expired_rollover, dec!(3));
        assert_eq!(g.rollovers.len(), 2);
        assert_eq!(g.rollovers[0], keep);
        assert_eq!(g.rollovers[1].balance, dec!(5));
        assert_eq!(g.rollovers[1].sequence, 1);
    }

    #[test]
    fn test_expired_and_lifetime_grants_never_reset() {
        let mut expired = monthly(dec!(10)).with_expiry(at(0));
        assert!(reset_grant(&mut expired, at(1)).unwrap().is_none());

        let mut lifetime = grant(dec!(10));
        assert!(reset_grant(&mut lifetime, at(1)).unwrap().is_none());
    }

    #[test]
    fn test_overage_is_cleared() {
        let mut g = monthly(dec!(10)).with_overage(None);
        g.current_balance = dec!(-4);
        g.usage = dec!(14);
        let outcome = reset_grant(&mut g, at(1)).unwrap().unwrap();
        assert_eq!(outcome.cleared_overage, dec!(4));
        assert_eq!(outcome.forfeited, dec!(0));
        assert_eq!(g.current_balance, dec!(10));
    }

    proptest! {
        #[test]
        fn prop_carry_never_exceeds_cap(unused in 0u32..10_000, cap in 0u32..5_000) {
            let mut g = monthly(Decimal::from(unused))
                .with_rollover(RolloverPolicy::forever(Some(Decimal::from(cap))));
            let outcome = reset_grant(&mut g, at(1)).unwrap().unwrap();
            prop_assert_eq!(outcome.carried, Decimal::from(unused.min(cap)));
            prop_assert_eq!(outcome.carried + outcome.forfeited, Decimal::from(unused));
        }

        #[test]
        fn prop_conservation_across_resets(
            usage in proptest::collection::vec(0u32..300, 1..8),
            cap in proptest::option::of(0u32..200),
        ) {
            let mut grants = vec![grant(dec!(100))
                .with_reset(Interval::Day, 1, at(86_400_000))
                .with_rollover(RolloverPolicy::forever(cap.map(Decimal::from)))];
            let total = |grants: &[EntitlementGrant]| {
                grants
                    .iter()
                    .map(|g| g.current_balance + g.rollovers.iter().map(|b| b.balance).sum::<Decimal>())
                    .sum::<Decimal>()
            };
            let query = BalanceQuery::new(grants[0].customer_id.clone(), grants[0].feature_id.clone(), None);
            let relevant = [RelevantFeature::own(grants[0].feature_id.clone())];
            let initial = total(&grants);
            let mut used = Decimal::ZERO;
            let mut regranted = Decimal::ZERO;
            let mut forfeited = Decimal::ZERO;

            for (day, u) in usage.iter().enumerate() {
                let now = at(86_400_000 * (day as i64 + 1) + 1);
                for outcome in reset_due(&mut grants, now).unwrap() {
                    regranted += outcome.regranted;
                    forfeited += outcome.forfeited;
                }
                let res = resolve(&grants, &query, &relevant, now);
                used += deduct(&mut grants, &res, Decimal::from(*u), false).unwrap().deducted;
            }
            prop_assert_eq!(initial + regranted - total(&grants), used + forfeited);
        }
    }
}
