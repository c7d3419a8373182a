//! Deduction engine
//!
//! Applies a usage delta to an in-memory snapshot of grants, walking the
//! candidates in resolver order. Nothing here touches storage; the caller
//! persists the grants listed in [`DeductionOutcome::touched`].
//!
//! Arithmetic is checked: an amount that would overflow the decimal range at
//! some candidate's cost fails with [`LedgerError::InvalidAmount`] and leaves
//! that grant untouched.

use ledger_common::{EntityId, GrantId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};
use crate::grant::EntitlementGrant;
use crate::resolver::{Candidate, CandidateSource, Resolution};

/// What happens to a shortfall when no grant allows overage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverageBehaviour {
    /// Fail the whole deduction, leaving balances untouched
    #[default]
    Reject,
    /// Apply what is available and report the rest
    Cap,
}

/// How a credit is booked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    /// Negative usage: gives back consumed balance, never beyond what was used
    Refund,
    /// Manual grant, purchase or top-up: raises the adjustment
    Adjustment,
}

/// Change applied to one candidate, in grant units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDelta {
    pub grant_id: GrantId,
    pub source: CandidateSource,
    pub entity: Option<EntityId>,
    /// Positive when consumed, negative when credited
    pub amount: Decimal,
}

/// Result of a deduction, in requested units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeductionOutcome {
    pub requested: Decimal,
    /// Applied amount, including overage
    pub deducted: Decimal,
    /// Part of `deducted` that drove a balance negative
    pub overage: Decimal,
    /// Part of `requested` nothing could absorb
    pub shortfall: Decimal,
    pub deltas: Vec<CandidateDelta>,
}

impl DeductionOutcome {
    /// Whether the full amount was applied
    pub fn is_complete(&self) -> bool {
        self.shortfall.is_zero()
    }

    /// Grants changed by this deduction
    pub fn touched(&self) -> BTreeSet<GrantId> {
        self.deltas.iter().map(|d| d.grant_id).collect()
    }
}

/// Result of a credit, in requested units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditOutcome {
    pub kind: CreditKind,
    pub requested: Decimal,
    pub credited: Decimal,
    /// Refund beyond recorded usage
    pub uncredited: Decimal,
    pub deltas: Vec<CandidateDelta>,
}

impl CreditOutcome {
    /// Grants changed by this credit
    pub fn touched(&self) -> BTreeSet<GrantId> {
        self.deltas.iter().map(|d| d.grant_id).collect()
    }
}

fn find<'a>(grants: &'a [EntitlementGrant], id: &GrantId) -> Option<&'a EntitlementGrant> {
    grants.iter().find(|g| g.id == *id)
}

fn find_mut<'a>(grants: &'a mut [EntitlementGrant], id: &GrantId) -> Option<&'a mut EntitlementGrant> {
    grants.iter_mut().find(|g| g.id == *id)
}

fn live_balance(grants: &[EntitlementGrant], c: &Candidate) -> Decimal {
    let Some(grant) = find(grants, &c.grant_id) else {
        return Decimal::ZERO;
    };
    match c.source {
        CandidateSource::Current => grant.balance_for(c.entity.as_ref()),
        CandidateSource::Rollover(bucket_id) => grant
            .rollovers
            .iter()
            .find(|b| b.id == bucket_id)
            .map_or(Decimal::ZERO, |b| b.balance_for(c.entity.as_ref())),
    }
}

fn overflow(amount: Decimal) -> LedgerError {
    LedgerError::InvalidAmount(format!("{amount} overflows the balance range"))
}

/// Requested units in grant units
fn scaled(units: Decimal, cost: Decimal) -> LedgerResult<Decimal> {
    units.checked_mul(cost).ok_or_else(|| overflow(units))
}

/// Grant units back in requested units
fn unscaled(amount: Decimal, cost: Decimal) -> LedgerResult<Decimal> {
    amount
        .checked_div(cost)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("cannot convert {amount} at cost {cost}")))
}

fn consume(grants: &mut [EntitlementGrant], c: &Candidate, amount: Decimal) -> LedgerResult<()> {
    let Some(grant) = find_mut(grants, &c.grant_id) else {
        return Ok(());
    };
    if grant.current_balance.checked_sub(amount).is_none() || grant.usage.checked_add(amount).is_none() {
        return Err(overflow(amount));
    }
    match c.source {
        CandidateSource::Current => match c.entity.as_ref() {
            Some(entity) if grant.is_per_entity() => {
                if let Some(slice) = grant.entity_slice_mut(entity) {
                    slice.consume(amount);
                }
                grant.recompute_aggregate();
            }
            _ => {
                grant.current_balance -= amount;
                grant.usage += amount;
            }
        },
        CandidateSource::Rollover(bucket_id) => {
            if let Some(bucket) = grant.rollovers.iter_mut().find(|b| b.id == bucket_id) {
                bucket.consume(c.entity.as_ref(), amount);
            }
        }
    }
    Ok(())
}

fn restore(grants: &mut [EntitlementGrant], c: &Candidate, amount: Decimal, kind: CreditKind) -> LedgerResult<()> {
    let Some(grant) = find_mut(grants, &c.grant_id) else {
        return Ok(());
    };
    let counter = match kind {
        CreditKind::Refund => grant.usage.checked_sub(amount),
        CreditKind::Adjustment => grant.adjustment.checked_add(amount),
    };
    if grant.current_balance.checked_add(amount).is_none() || counter.is_none() {
        return Err(overflow(amount));
    }
    match c.entity.as_ref() {
        Some(entity) if grant.is_per_entity() => {
            if let Some(slice) = grant.entity_slice_mut(entity) {
                match kind {
                    CreditKind::Refund => slice.restore(amount),
                    CreditKind::Adjustment => slice.adjust(amount),
                }
            }
            grant.recompute_aggregate();
        }
        _ => {
            grant.current_balance += amount;
            match kind {
                CreditKind::Refund => grant.usage -= amount,
                CreditKind::Adjustment => grant.adjustment += amount,
            }
        }
    }
    Ok(())
}

fn delta(c: &Candidate, amount: Decimal) -> CandidateDelta {
    CandidateDelta {
        grant_id: c.grant_id,
        source: c.source,
        entity: c.entity.clone(),
        amount,
    }
}

/// Deduct `amount` requested units across the resolved candidates
///
/// Candidates are drained in order, skipping any without positive balance.
/// What is left goes to the overage target when `allow_negative` is set,
/// bounded by its `usage_limit`; anything still left is the shortfall.
pub fn deduct(
    grants: &mut [EntitlementGrant],
    resolution: &Resolution,
    amount: Decimal,
    allow_negative: bool,
) -> LedgerResult<DeductionOutcome> {
    let mut remaining = amount.max(Decimal::ZERO);
    let mut deltas = Vec::new();

    for candidate in &resolution.candidates {
        if remaining <= Decimal::ZERO {
            break;
        }
        let balance = live_balance(grants, candidate);
        if balance <= Decimal::ZERO {
            continue;
        }
        let needed = scaled(remaining, candidate.cost)?;
        let take = balance.min(needed);
        consume(grants, candidate, take)?;
        deltas.push(delta(candidate, take));
        debug!(grant = %candidate.grant_id, source = ?candidate.source, take = %take, "drew from candidate");
        remaining = if take == needed {
            Decimal::ZERO
        } else {
            remaining - unscaled(take, candidate.cost)?
        };
    }

    let mut overage = Decimal::ZERO;
    if remaining > Decimal::ZERO && allow_negative {
        if let Some(target) = resolution.overage_target() {
            let needed = scaled(remaining, target.cost)?;
            let limit = find(grants, &target.grant_id).and_then(|g| g.usage_limit);
            let room = match limit {
                Some(limit) => live_balance(grants, target)
                    .checked_add(limit)
                    .ok_or_else(|| overflow(limit))?
                    .max(Decimal::ZERO)
                    .min(needed),
                None => needed,
            };
            if room > Decimal::ZERO {
                consume(grants, target, room)?;
                deltas.push(delta(target, room));
                overage = if room == needed { remaining } else { unscaled(room, target.cost)? };
                remaining -= overage;
                debug!(grant = %target.grant_id, overage = %overage, "applied overage");
            }
        }
    }

    let shortfall = remaining.max(Decimal::ZERO);
    Ok(DeductionOutcome {
        requested: amount,
        deducted: amount - shortfall,
        overage,
        shortfall,
        deltas,
    })
}

/// Credit `amount` to current-cycle balances, never to rollover buckets
///
/// Targets are the most specific, most recently created grants of the
/// requested feature. A refund gives back usage target by target and stops
/// once every target's usage is zero; an adjustment lands on the first
/// target.
pub fn credit(
    grants: &mut [EntitlementGrant],
    resolution: &Resolution,
    amount: Decimal,
    kind: CreditKind,
) -> LedgerResult<CreditOutcome> {
    let targets = resolution.credit_targets(grants);
    let mut remaining = amount.max(Decimal::ZERO);
    let mut deltas = Vec::new();

    match kind {
        CreditKind::Refund => {
            for target in targets {
                if remaining <= Decimal::ZERO {
                    break;
                }
                let used = find(grants, &target.grant_id)
                    .map_or(Decimal::ZERO, |g| g.usage_for(target.entity.as_ref()));
                let give = used.min(remaining);
                if give <= Decimal::ZERO {
                    continue;
                }
                restore(grants, target, give, kind)?;
                deltas.push(delta(target, -give));
                remaining -= give;
            }
        }
        CreditKind::Adjustment => {
            if let Some(target) = targets.first() {
                restore(grants, target, remaining, kind)?;
                deltas.push(delta(target, -remaining));
                remaining = Decimal::ZERO;
            }
        }
    }

    Ok(CreditOutcome {
        kind,
        requested: amount,
        credited: amount - remaining,
        uncredited: remaining,
        deltas,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RelevantFeature;
    use crate::grant::tests::{cus, ent, feat, grant, JAN_1};
    use crate::resolver::{resolve, BalanceQuery};
    use crate::rollover::RolloverBucket;
    use ledger_common::Timestamp;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn now() -> Timestamp {
        Timestamp::from_millis(JAN_1 + 1_000)
    }

    fn query(entity: Option<&str>) -> BalanceQuery {
        BalanceQuery::new(cus(), feat("messages"), entity.map(ent))
    }

    fn own() -> Vec<RelevantFeature> {
        vec![RelevantFeature::own(feat("messages"))]
    }

    fn run(grants: &mut [EntitlementGrant], entity: Option<&str>, amount: Decimal) -> DeductionOutcome {
        let res = resolve(grants, &query(entity), &own(), now());
        let allow = res.allows_overage();
        deduct(grants, &res, amount, allow).unwrap()
    }

    fn with_buckets(current: Decimal, buckets: &[(Decimal, Option<i64>)]) -> EntitlementGrant {
        let mut g = grant(current);
        for (seq, (balance, expires_in)) in buckets.iter().enumerate() {
            let b = RolloverBucket::new(
                g.id,
                *balance,
                expires_in.map(|ms| now().add_millis(ms)),
                seq as u64,
                now(),
            );
            g.push_rollover(b);
        }
        g
    }

    #[test]
    fn test_oldest_bucket_drained_first() {
        let mut grants = vec![with_buckets(dec!(0), &[(dec!(400), Some(20_000)), (dec!(100), Some(10_000))])];
        let outcome = run(&mut grants, None, dec!(150));

        assert!(outcome.is_complete());
        let g = &grants[0];
        assert_eq!(g.current_balance, dec!(0));
        assert_eq!(g.rollovers[1].balance, dec!(0));
        assert_eq!(g.rollovers[0].balance, dec!(350));
        assert_eq!(g.rollovers[0].usage, dec!(50));
        assert_eq!(outcome.deltas.len(), 2);
    }

    #[test]
    fn test_current_balance_before_buckets() {
        let mut grants = vec![with_buckets(dec!(40), &[(dec!(100), None)])];
        run(&mut grants, None, dec!(60));
        assert_eq!(grants[0].current_balance, dec!(0));
        assert_eq!(grants[0].usage, dec!(40));
        assert_eq!(grants[0].rollovers[0].balance, dec!(80));
    }

    #[test]
    fn test_shortfall_without_overage() {
        let mut grants = vec![grant(dec!(30))];
        let outcome = run(&mut grants, None, dec!(50));
        assert_eq!(outcome.deducted, dec!(30));
        assert_eq!(outcome.shortfall, dec!(20));
        assert_eq!(outcome.overage, dec!(0));
        assert_eq!(grants[0].current_balance, dec!(0));
    }

    #[test]
    fn test_overage_drives_customer_grant_negative_by_shortfall() {
        let mut grants = vec![grant(dec!(30)).with_overage(None)];
        let outcome = run(&mut grants, None, dec!(50));
        assert!(outcome.is_complete());
        assert_eq!(outcome.overage, dec!(20));
        assert_eq!(grants[0].current_balance, dec!(-20));
        assert_eq!(grants[0].usage, dec!(50));
        assert!(grants[0].check_invariants().is_ok());
    }

    #[test]
    fn test_usage_limit_bounds_overage() {
        let mut grants = vec![grant(dec!(30)).with_overage(Some(dec!(10)))];
        let outcome = run(&mut grants, None, dec!(50));
        assert_eq!(outcome.overage, dec!(10));
        assert_eq!(outcome.shortfall, dec!(10));
        assert_eq!(grants[0].current_balance, dec!(-10));
    }

    #[test]
    fn test_credit_system_consumes_cost_per_unit() {
        let messages = grant(dec!(5));
        let mut credits = grant(dec!(100));
        credits.feature_id = feat("credits");
        let mut grants = vec![credits, messages];
        let relevant = vec![
            RelevantFeature::own(feat("messages")),
            RelevantFeature {
                feature_id: feat("credits"),
                cost: dec!(3),
                credit_system: true,
            },
        ];
        let res = resolve(&grants, &query(None), &relevant, now());
        let outcome = deduct(&mut grants, &res, dec!(10), false).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(grants[1].current_balance, dec!(0));
        assert_eq!(grants[0].current_balance, dec!(85));
    }

    #[test]
    fn test_amount_overflowing_at_cost_is_rejected() {
        let mut credits = grant(dec!(100));
        credits.feature_id = feat("credits");
        let mut grants = vec![credits];
        let relevant = vec![
            RelevantFeature::own(feat("messages")),
            RelevantFeature {
                feature_id: feat("credits"),
                cost: dec!(3),
                credit_system: true,
            },
        ];
        let res = resolve(&grants, &query(None), &relevant, now());
        let err = deduct(&mut grants, &res, Decimal::MAX, false).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(grants[0].current_balance, dec!(100));
        assert_eq!(grants[0].usage, dec!(0));
    }

    #[test]
    fn test_overage_past_decimal_range_is_rejected() {
        let mut grants = vec![grant(dec!(10)).with_overage(None)];
        run(&mut grants, None, dec!(20));
        assert_eq!(grants[0].current_balance, dec!(-10));

        let res = resolve(&grants, &query(None), &own(), now());
        let err = deduct(&mut grants, &res, Decimal::MAX, true).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(grants[0].current_balance, dec!(-10));
    }

    #[test]
    fn test_adjustment_past_decimal_range_is_rejected() {
        let mut grants = vec![grant(dec!(10))];
        let res = resolve(&grants, &query(None), &own(), now());
        let err = credit(&mut grants, &res, Decimal::MAX, CreditKind::Adjustment).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
        assert_eq!(grants[0].current_balance, dec!(10));
        assert_eq!(grants[0].adjustment, dec!(0));
    }

    #[test]
    fn test_entity_deduction_keeps_aggregate() {
        let mut grants = vec![grant(dec!(50)).per_entity([ent("seat_a"), ent("seat_b")]), grant(dec!(20))];
        let outcome = run(&mut grants, Some("seat_a"), dec!(60));
        assert!(outcome.is_complete());
        let seats = &grants[0];
        assert_eq!(seats.balance_for(Some(&ent("seat_a"))), dec!(0));
        assert_eq!(seats.balance_for(Some(&ent("seat_b"))), dec!(50));
        assert_eq!(seats.current_balance, dec!(50));
        assert_eq!(grants[1].current_balance, dec!(10));
        assert!(seats.check_invariants().is_ok());
    }

    #[test]
    fn test_refund_capped_by_usage() {
        let mut grants = vec![grant(dec!(100))];
        run(&mut grants, None, dec!(30));
        let res = resolve(&grants, &query(None), &own(), now());
        let outcome = credit(&mut grants, &res, dec!(50), CreditKind::Refund).unwrap();
        assert_eq!(outcome.credited, dec!(30));
        assert_eq!(outcome.uncredited, dec!(20));
        assert_eq!(grants[0].current_balance, dec!(100));
        assert_eq!(grants[0].usage, dec!(0));
    }

    #[test]
    fn test_adjustment_targets_most_recent_grant_never_bucket() {
        let old = with_buckets(dec!(10), &[(dec!(5), None)]);
        let mut recent = grant(dec!(10));
        recent.created_at = old.created_at.add_millis(10);
        let mut grants = vec![old, recent];
        let res = resolve(&grants, &query(None), &own(), now());
        let outcome = credit(&mut grants, &res, dec!(25), CreditKind::Adjustment).unwrap();
        assert_eq!(outcome.credited, dec!(25));
        assert_eq!(grants[1].current_balance, dec!(35));
        assert_eq!(grants[1].adjustment, dec!(25));
        assert_eq!(grants[0].current_balance, dec!(10));
        assert_eq!(grants[0].rollovers[0].balance, dec!(5));
        assert!(grants[1].check_invariants().is_ok());
    }

    fn total_balance(grants: &[EntitlementGrant]) -> Decimal {
        grants
            .iter()
            .map(|g| g.current_balance + g.rollovers.iter().map(|b| b.balance).sum::<Decimal>())
            .sum()
    }

    fn total_usage(grants: &[EntitlementGrant]) -> Decimal {
        grants
            .iter()
            .map(|g| g.usage + g.rollovers.iter().map(|b| b.usage).sum::<Decimal>())
            .sum()
    }

    #[derive(Debug, Clone)]
    enum Op {
        Track(u32),
        Refund(u32),
        Adjust(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..200).prop_map(Op::Track),
            (1u32..100).prop_map(Op::Refund),
            (1u32..100).prop_map(Op::Adjust),
        ]
    }

    proptest! {
        #[test]
        fn prop_conservation(
            ops in proptest::collection::vec(op(), 1..30),
            overage in any::<bool>(),
            entity in any::<bool>(),
        ) {
            let mut seats = grant(dec!(40)).per_entity([ent("seat_a"), ent("seat_b")]);
            if overage {
                seats = seats.with_overage(Some(dec!(50)));
            }
            let mut grants = vec![
                with_buckets(dec!(100), &[(dec!(30), Some(5_000)), (dec!(20), None)]),
                seats,
            ];
            let scope = entity.then_some("seat_a");
            let initial = total_balance(&grants);
            let initial_usage = total_usage(&grants);
            let mut credited = Decimal::ZERO;

            for op in ops {
                let res = resolve(&grants, &query(scope), &own(), now());
                match op {
                    Op::Track(n) => {
                        let allow = res.allows_overage();
                        deduct(&mut grants, &res, Decimal::from(n), allow).unwrap();
                    }
                    Op::Refund(n) => {
                        credit(&mut grants, &res, Decimal::from(n), CreditKind::Refund).unwrap();
                    }
                    Op::Adjust(n) => {
                        credited += credit(&mut grants, &res, Decimal::from(n), CreditKind::Adjustment).unwrap().credited;
                    }
                }
                for g in &grants {
                    prop_assert!(g.check_invariants().is_ok());
                }
            }

            let used = total_usage(&grants) - initial_usage;
            prop_assert_eq!(initial + credited - total_balance(&grants), used);
        }
    }
}
