//! Balance resolution
//!
//! Turns a customer's grants into the ordered candidate list a deduction walks,
//! or into a balance breakdown for reads. Ordering is total, so the result
//! never depends on the order grants were loaded in:
//!
//! ```text
//! grants:  tier ─► own feature before credit system ─► next_reset_at (none last)
//!               ─► created_at ─► grant id
//! within:  current balance (slices in entity order)
//!               ─► buckets by expires_at (none last) ─► sequence ─► bucket id
//! ```

use ledger_common::{BucketId, CustomerId, EntityId, FeatureId, GrantId, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::catalog::RelevantFeature;
use crate::grant::EntitlementGrant;
use crate::rollover::RolloverBucket;

/// How specific a grant is to the requested scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeTier {
    /// Attached directly to the entity
    EntityOwned,
    /// The entity's slice of a shared per-entity grant
    EntitySlice,
    /// Customer-level pool
    Customer,
}

/// Where a candidate's balance lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "bucket_id")]
pub enum CandidateSource {
    /// The grant's current-cycle balance
    Current,
    /// One of the grant's rollover buckets
    Rollover(BucketId),
}

/// One balance a deduction may draw from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub grant_id: GrantId,
    pub source: CandidateSource,
    /// Entity slice drawn from, for per-entity grants
    pub entity: Option<EntityId>,
    pub feature_id: FeatureId,
    /// Grant units consumed per requested unit
    pub cost: Decimal,
    /// Drawn from a credit system rather than the feature itself
    pub credit_system: bool,
    pub tier: ScopeTier,
    pub usage_allowed: bool,
    /// Balance when resolved
    pub balance: Decimal,
}

impl Candidate {
    /// Whether this candidate draws from a current-cycle balance
    pub fn is_current(&self) -> bool {
        self.source == CandidateSource::Current
    }
}

/// What to resolve
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BalanceQuery {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    pub entity_id: Option<EntityId>,
}

impl BalanceQuery {
    pub fn new(customer_id: CustomerId, feature_id: FeatureId, entity_id: Option<EntityId>) -> Self {
        Self {
            customer_id,
            feature_id,
            entity_id,
        }
    }
}

/// Ordered deduction candidates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub candidates: Vec<Candidate>,
    /// Some eligible grant is unlimited
    pub unlimited: bool,
}

impl Resolution {
    /// Sum of positive candidate balances, in requested units
    pub fn available(&self) -> Decimal {
        self.candidates
            .iter()
            .filter(|c| c.balance > Decimal::ZERO)
            .map(|c| c.balance / c.cost)
            .sum()
    }

    /// Net of every candidate balance, negative ones included, in grant units
    pub fn net_balance(&self) -> Decimal {
        self.candidates.iter().map(|c| c.balance).sum()
    }

    /// Whether any candidate may be driven negative
    pub fn allows_overage(&self) -> bool {
        self.overage_target().is_some()
    }

    /// Candidate absorbing overage
    ///
    /// The last customer-level current balance that allows usage, else the
    /// last current balance that allows usage.
    pub fn overage_target(&self) -> Option<&Candidate> {
        let allowed = || self.candidates.iter().filter(|c| c.is_current() && c.usage_allowed);
        allowed()
            .filter(|c| c.tier == ScopeTier::Customer)
            .last()
            .or_else(|| allowed().last())
    }

    /// Current-cycle candidates of the requested feature, most specific and
    /// most recent first
    pub fn credit_targets<'a>(&'a self, grants: &[EntitlementGrant]) -> Vec<&'a Candidate> {
        let created = |id: &GrantId| {
            grants
                .iter()
                .find(|g| g.id == *id)
                .map(|g| g.created_at)
                .unwrap_or(Timestamp::from_millis(0))
        };
        let mut targets: Vec<_> = self
            .candidates
            .iter()
            .filter(|c| c.is_current() && !c.credit_system)
            .collect();
        targets.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then_with(|| created(&b.grant_id).cmp(&created(&a.grant_id)))
                .then_with(|| a.grant_id.cmp(&b.grant_id))
                .then_with(|| a.entity.cmp(&b.entity))
        });
        targets
    }
}

fn reset_order(a: Option<Timestamp>, b: Option<Timestamp>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn bucket_order(a: &RolloverBucket, b: &RolloverBucket) -> Ordering {
    reset_order(a.expires_at, b.expires_at)
        .then_with(|| a.sequence.cmp(&b.sequence))
        .then_with(|| a.id.cmp(&b.id))
}

struct Eligible<'a> {
    grant: &'a EntitlementGrant,
    tier: ScopeTier,
    relevant: &'a RelevantFeature,
    scopes: Vec<Option<EntityId>>,
}

fn eligibility<'a>(
    grant: &'a EntitlementGrant,
    query: &BalanceQuery,
    relevant: &'a [RelevantFeature],
    now: Timestamp,
    include_foreign_entities: bool,
) -> Option<Eligible<'a>> {
    if grant.customer_id != query.customer_id || grant.is_expired(now) {
        return None;
    }
    let relevant = relevant.iter().find(|r| r.feature_id == grant.feature_id)?;
    let per_entity_scopes = |entity: Option<&EntityId>| -> Vec<Option<EntityId>> {
        match (entity, grant.entity_slices()) {
            (Some(e), Some(slices)) if slices.contains_key(e) => vec![Some(e.clone())],
            (Some(_), Some(_)) => Vec::new(),
            (None, Some(slices)) => slices.keys().cloned().map(Some).collect(),
            (_, None) => vec![None],
        }
    };
    let (tier, scopes) = match (&grant.entity_id, &query.entity_id) {
        (Some(owner), Some(requested)) if owner == requested => {
            (ScopeTier::EntityOwned, per_entity_scopes(Some(requested)))
        }
        (Some(_), Some(_)) => return None,
        (Some(_), None) if include_foreign_entities => (ScopeTier::EntityOwned, vec![None]),
        (Some(_), None) => return None,
        (None, entity) if grant.is_per_entity() => (ScopeTier::EntitySlice, per_entity_scopes(entity.as_ref())),
        (None, _) => (ScopeTier::Customer, vec![None]),
    };
    if scopes.is_empty() {
        return None;
    }
    Some(Eligible {
        grant,
        tier,
        relevant,
        scopes,
    })
}

/// Ordered candidates for a deduction or credit
///
/// Grants owned by an entity are only eligible when that entity is queried.
/// Unlimited grants set [`Resolution::unlimited`] and contribute no candidates.
pub fn resolve(
    grants: &[EntitlementGrant],
    query: &BalanceQuery,
    relevant: &[RelevantFeature],
    now: Timestamp,
) -> Resolution {
    let mut eligible: Vec<Eligible<'_>> = grants
        .iter()
        .filter_map(|g| eligibility(g, query, relevant, now, false))
        .collect();

    eligible.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.relevant.credit_system.cmp(&b.relevant.credit_system))
            .then_with(|| reset_order(a.grant.next_reset_at, b.grant.next_reset_at))
            .then_with(|| a.grant.created_at.cmp(&b.grant.created_at))
            .then_with(|| a.grant.id.cmp(&b.grant.id))
    });

    let mut resolution = Resolution::default();
    for item in eligible {
        let grant = item.grant;
        if grant.unlimited {
            resolution.unlimited = true;
            continue;
        }
        let candidate = |source: CandidateSource, entity: &Option<EntityId>, balance: Decimal| Candidate {
            grant_id: grant.id,
            source,
            entity: entity.clone(),
            feature_id: grant.feature_id.clone(),
            cost: item.relevant.cost,
            credit_system: item.relevant.credit_system,
            tier: item.tier,
            usage_allowed: grant.usage_allowed,
            balance,
        };

        for scope in &item.scopes {
            resolution
                .candidates
                .push(candidate(CandidateSource::Current, scope, grant.balance_for(scope.as_ref())));
        }

        let mut buckets: Vec<&RolloverBucket> = grant.active_rollovers(now).collect();
        buckets.sort_by(|a, b| bucket_order(a, b));
        for bucket in buckets {
            for scope in &item.scopes {
                let balance = bucket.balance_for(scope.as_ref());
                if balance > Decimal::ZERO {
                    resolution
                        .candidates
                        .push(candidate(CandidateSource::Rollover(bucket.id), scope, balance));
                }
            }
        }
    }
    resolution
}

/// Balance of one rollover bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketBalance {
    pub bucket_id: BucketId,
    pub balance: Decimal,
    pub usage: Decimal,
    pub expires_at: Option<Timestamp>,
}

/// Balance of one grant within a read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantBalance {
    pub grant_id: GrantId,
    pub tier: ScopeTier,
    pub unlimited: bool,
    pub granted: Decimal,
    pub current_balance: Decimal,
    pub usage: Decimal,
    pub next_reset_at: Option<Timestamp>,
    pub rollovers: Vec<BucketBalance>,
}

/// Breakdown of a feature balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBalance {
    pub feature_id: FeatureId,
    pub entity_id: Option<EntityId>,
    pub unlimited: bool,
    /// Current-cycle balance across grants
    pub current: Decimal,
    /// Unexpired carried-over balance
    pub rollover: Decimal,
    pub usage: Decimal,
    pub granted: Decimal,
    pub grants: Vec<GrantBalance>,
}

impl FeatureBalance {
    /// Zero balance with no grants
    pub fn empty(feature_id: FeatureId, entity_id: Option<EntityId>) -> Self {
        Self {
            feature_id,
            entity_id,
            unlimited: false,
            current: Decimal::ZERO,
            rollover: Decimal::ZERO,
            usage: Decimal::ZERO,
            granted: Decimal::ZERO,
            grants: Vec::new(),
        }
    }

    /// Everything that can still be drawn
    pub fn total(&self) -> Decimal {
        self.current + self.rollover
    }
}

/// Balance breakdown of the queried feature
///
/// Without an entity the read covers every grant of the customer, including
/// entity-owned ones; with an entity it covers what a deduction for that
/// entity could draw on.
pub fn read_balance(grants: &[EntitlementGrant], query: &BalanceQuery, now: Timestamp) -> FeatureBalance {
    let relevant = [RelevantFeature::own(query.feature_id.clone())];
    let mut eligible: Vec<Eligible<'_>> = grants
        .iter()
        .filter_map(|g| eligibility(g, query, &relevant, now, true))
        .collect();
    eligible.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then_with(|| a.grant.created_at.cmp(&b.grant.created_at))
            .then_with(|| a.grant.id.cmp(&b.grant.id))
    });

    let mut balance = FeatureBalance::empty(query.feature_id.clone(), query.entity_id.clone());

    for item in eligible {
        let grant = item.grant;
        // a read without entity uses the aggregate of a per-entity grant
        let scopes: Vec<Option<EntityId>> = if query.entity_id.is_none() {
            vec![None]
        } else {
            item.scopes
        };
        let mut current = Decimal::ZERO;
        let mut usage = Decimal::ZERO;
        let mut granted = Decimal::ZERO;
        for scope in &scopes {
            let scope = scope.as_ref();
            current += grant.balance_for(scope);
            usage += grant.usage_for(scope);
            granted += match (scope, grant.entity_slices()) {
                (Some(e), Some(slices)) => slices.get(e).map_or(Decimal::ZERO, |s| s.granted),
                _ => grant.granted_balance,
            };
        }
        let mut buckets: Vec<&RolloverBucket> = grant.active_rollovers(now).collect();
        buckets.sort_by(|a, b| bucket_order(a, b));
        let rollovers: Vec<BucketBalance> = buckets
            .into_iter()
            .map(|b| BucketBalance {
                bucket_id: b.id,
                balance: scopes.iter().map(|s| b.balance_for(s.as_ref())).sum(),
                usage: b.usage,
                expires_at: b.expires_at,
            })
            .collect();

        balance.unlimited |= grant.unlimited;
        if !grant.unlimited {
            balance.current += current;
            balance.usage += usage;
            balance.granted += granted;
            balance.rollover += rollovers.iter().map(|b| b.balance).sum::<Decimal>();
        }
        balance.grants.push(GrantBalance {
            grant_id: grant.id,
            tier: item.tier,
            unlimited: grant.unlimited,
            granted,
            current_balance: current,
            usage,
            next_reset_at: grant.next_reset_at,
            rollovers,
        });
    }
    balance
}
