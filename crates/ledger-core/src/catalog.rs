//! Feature catalog boundary
//!
//! Feature definitions and billing controls are owned elsewhere; the ledger
//! only reads them, once per operation.

use async_trait::async_trait;
use ledger_common::{CustomerId, FeatureId};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::topup::AutoTopupConfig;

/// What a feature measures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureKind {
    /// On/off access, never deducted
    Boolean,
    /// Counted usage
    Metered,
    /// Shared pool paying for other features at a per-unit cost
    CreditSystem {
        /// Credits consumed per unit of each metered feature
        costs: BTreeMap<FeatureId, Decimal>,
    },
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub id: FeatureId,
    pub kind: FeatureKind,
    /// Grants of this feature are split per entity
    #[serde(default)]
    pub entity_scoped: bool,
}

impl FeatureDefinition {
    /// Metered feature
    pub fn metered(id: FeatureId) -> Self {
        Self {
            id,
            kind: FeatureKind::Metered,
            entity_scoped: false,
        }
    }

    /// Credit system pricing the given features
    pub fn credit_system(id: FeatureId, costs: impl IntoIterator<Item = (FeatureId, Decimal)>) -> Self {
        Self {
            id,
            kind: FeatureKind::CreditSystem {
                costs: costs.into_iter().collect(),
            },
            entity_scoped: false,
        }
    }

    /// Boolean feature
    pub fn boolean(id: FeatureId) -> Self {
        Self {
            id,
            kind: FeatureKind::Boolean,
            entity_scoped: false,
        }
    }

    /// Mark entity scoped
    pub fn entity_scoped(mut self) -> Self {
        self.entity_scoped = true;
        self
    }

    /// Whether usage can be deducted against it
    pub fn is_deductible(&self) -> bool {
        !matches!(self.kind, FeatureKind::Boolean)
    }

    /// Credit cost of one unit of `feature`, if this is a credit system pricing it
    pub fn cost_of(&self, feature: &FeatureId) -> Option<Decimal> {
        match &self.kind {
            FeatureKind::CreditSystem { costs } => costs.get(feature).copied(),
            _ => None,
        }
    }
}

/// A feature whose grants can pay for a requested feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevantFeature {
    pub feature_id: FeatureId,
    /// Units of this feature per unit requested
    pub cost: Decimal,
    pub credit_system: bool,
}

impl RelevantFeature {
    /// The requested feature paying for itself
    pub fn own(feature_id: FeatureId) -> Self {
        Self {
            feature_id,
            cost: Decimal::ONE,
            credit_system: false,
        }
    }
}

/// Feature and billing-control lookup
#[async_trait]
pub trait FeatureCatalog: Send + Sync {
    /// Definition of a feature
    async fn feature(&self, id: &FeatureId) -> Option<FeatureDefinition>;

    /// Credit systems whose schema lists `id`
    async fn credit_systems_for(&self, id: &FeatureId) -> Vec<FeatureDefinition>;

    /// Auto top-up controls of a customer for a feature
    async fn auto_topup(&self, customer: &CustomerId, feature: &FeatureId) -> Option<AutoTopupConfig>;
}

/// The requested feature followed by the credit systems that price it
pub async fn relevant_features(catalog: &dyn FeatureCatalog, feature: &FeatureDefinition) -> Vec<RelevantFeature> {
    let mut relevant = vec![RelevantFeature::own(feature.id.clone())];
    let mut systems = catalog.credit_systems_for(&feature.id).await;
    systems.sort_by(|a, b| a.id.cmp(&b.id));
    for system in systems {
        if let Some(cost) = system.cost_of(&feature.id) {
            if cost > Decimal::ZERO {
                relevant.push(RelevantFeature {
                    feature_id: system.id,
                    cost,
                    credit_system: true,
                });
            }
        }
    }
    relevant
}

/// In-memory catalog
pub struct InMemoryCatalog {
    features: RwLock<HashMap<FeatureId, FeatureDefinition>>,
    topups: RwLock<HashMap<(CustomerId, FeatureId), AutoTopupConfig>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            features: RwLock::new(HashMap::new()),
            topups: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a feature
    pub fn upsert_feature(&self, feature: FeatureDefinition) {
        self.features.write().insert(feature.id.clone(), feature);
    }

    /// Set a customer's top-up controls
    pub fn set_auto_topup(&self, customer: CustomerId, config: AutoTopupConfig) {
        self.topups
            .write()
            .insert((customer, config.feature_id.clone()), config);
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.features.read().len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.features.read().is_empty()
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureCatalog for InMemoryCatalog {
    async fn feature(&self, id: &FeatureId) -> Option<FeatureDefinition> {
        self.features.read().get(id).cloned()
    }

    async fn credit_systems_for(&self, id: &FeatureId) -> Vec<FeatureDefinition> {
        self.features
            .read()
            .values()
            .filter(|f| f.cost_of(id).is_some())
            .cloned()
            .collect()
    }

    async fn auto_topup(&self, customer: &CustomerId, feature: &FeatureId) -> Option<AutoTopupConfig> {
        self.topups
            .read()
            .get(&(customer.clone(), feature.clone()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn feat(id: &str) -> FeatureId {
        FeatureId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_relevant_features_lists_credit_systems_after_own() {
        let catalog = InMemoryCatalog::new();
        let messages = FeatureDefinition::metered(feat("messages"));
        catalog.upsert_feature(messages.clone());
        catalog.upsert_feature(FeatureDefinition::credit_system(
            feat("credits"),
            [(feat("messages"), dec!(0.5))],
        ));
        catalog.upsert_feature(FeatureDefinition::credit_system(
            feat("other_credits"),
            [(feat("images"), dec!(2))],
        ));

        let relevant = relevant_features(&catalog, &messages).await;
        assert_eq!(relevant.len(), 2);
        assert_eq!(relevant[0], RelevantFeature::own(feat("messages")));
        assert_eq!(relevant[1].feature_id, feat("credits"));
        assert_eq!(relevant[1].cost, dec!(0.5));
        assert!(relevant[1].credit_system);
    }

    #[test]
    fn test_boolean_is_not_deductible() {
        assert!(!FeatureDefinition::boolean(feat("sso")).is_deductible());
        assert!(FeatureDefinition::metered(feat("messages")).is_deductible());
    }

    #[test]
    fn test_kind_serde() {
        let def = FeatureDefinition::credit_system(feat("credits"), [(feat("messages"), dec!(3))]);
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("\"type\":\"credit_system\""));
        let back: FeatureDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
