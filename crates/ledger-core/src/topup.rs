//! Auto top-up
//!
//! After a deduction leaves a feature at or below its threshold the service
//! enqueues a top-up job instead of purchasing inline. The job re-reads the
//! balance under the customer lock, so of several racing triggers only the
//! first one to run buys anything.
//!
//! A purchase is recorded in the store under its idempotency key before it
//! is credited. Each purchase lands as its own lifetime grant so a cycle
//! reset of the plan grants leaves it in place.

use async_trait::async_trait;
use ledger_common::{CustomerId, DomainError, FeatureId, Timestamp};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::grant::Interval;

/// Cap on purchases within a rolling window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLimit {
    pub interval: Interval,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
    pub limit: u32,
}

fn default_interval_count() -> u32 {
    1
}

impl PurchaseLimit {
    /// Start of the window ending at `now`; `None` for a lifetime window
    pub fn window_start(&self, now: Timestamp) -> Result<Option<Timestamp>, DomainError> {
        self.interval.rewind(now, self.interval_count)
    }
}

/// Customer's top-up controls for one feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoTopupConfig {
    pub feature_id: FeatureId,
    pub enabled: bool,
    /// Top up when the balance is at or below this
    pub threshold: Decimal,
    /// Units bought per top-up
    pub quantity: Decimal,
    pub max_purchases: Option<PurchaseLimit>,
}

impl AutoTopupConfig {
    /// Whether `balance` warrants a top-up
    pub fn should_trigger(&self, balance: Decimal) -> bool {
        self.enabled && self.quantity > Decimal::ZERO && balance <= self.threshold
    }
}

/// Purchase handed to the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    pub quantity: Decimal,
    /// Stable per customer, feature and balance snapshot
    pub idempotency_key: String,
}

/// Completed purchase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    /// Units to credit
    pub quantity: Decimal,
    pub reference: String,
}

/// Purchase failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplenishmentError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("executor unavailable: {0}")]
    Unavailable(String),
}

/// Performs the purchase behind a top-up.
///
/// Implementations must charge at most once per idempotency key and answer a
/// repeated key with the original purchase.
#[async_trait]
pub trait ReplenishmentExecutor: Send + Sync {
    async fn purchase(&self, request: &PurchaseRequest) -> Result<Purchase, ReplenishmentError>;
}

/// What a top-up job did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TopupOutcome {
    /// Bought and credited
    Replenished { quantity: Decimal, balance: Decimal },
    /// Balance recovered before the job ran
    BalanceHealthy { balance: Decimal },
    /// No enabled controls
    Disabled,
    /// Window purchase limit reached
    LimitReached { purchases: u32 },
    /// Executor refused; balance unchanged
    PurchaseFailed { reason: String },
    /// Lock busy; job requeued or dropped
    Deferred { requeued: bool },
}

/// Executor that approves everything, for the CLI and tests
pub struct RecordingExecutor {
    requests: Mutex<Vec<PurchaseRequest>>,
    charges: Mutex<HashMap<String, Purchase>>,
    decline: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            charges: Mutex::new(HashMap::new()),
            decline: None,
        }
    }

    /// Executor that declines every purchase
    pub fn declining(reason: impl Into<String>) -> Self {
        Self {
            decline: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<PurchaseRequest> {
        self.requests.lock().clone()
    }

    /// Distinct charges made
    pub fn charges(&self) -> usize {
        self.charges.lock().len()
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplenishmentExecutor for RecordingExecutor {
    async fn purchase(&self, request: &PurchaseRequest) -> Result<Purchase, ReplenishmentError> {
        self.requests.lock().push(request.clone());
        if let Some(reason) = &self.decline {
            return Err(ReplenishmentError::Declined(reason.clone()));
        }
        let mut charges = self.charges.lock();
        let count = charges.len() + 1;
        let purchase = charges
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| Purchase {
                quantity: request.quantity,
                reference: format!("purchase_{count}"),
            });
        Ok(purchase.clone())
    }
}
