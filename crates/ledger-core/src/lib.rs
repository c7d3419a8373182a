//! Usage Ledger Core
//!
//! Balance resolution, deduction, reset/rollover and auto top-up for
//! metered entitlements.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          BALANCE SERVICE                                │
//! │                                                                         │
//! │  usage event ─► DeductionBatcher ─► Coordinator (customer lock)         │
//! │                                          │                              │
//! │                                          ▼                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Resolver   │─►│  Deduction   │─►│ DurableStore │─►│ Consistency │ │
//! │  │  (ordering)  │  │   Engine     │  │  (versioned) │  │    Sync     │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────────┘ │
//! │         ▲                                   │                 │        │
//! │         │ lazy reset                        │ threshold       ▼        │
//! │  ┌──────────────┐                  ┌────────▼───────┐  ┌─────────────┐ │
//! │  │    Reset     │                  │   Job Queue    │  │ Moka cache  │ │
//! │  │  Scheduler   │                  │ (auto top-up)  │  │             │ │
//! │  └──────────────┘                  └────────────────┘  └─────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Grants for one customer are only mutated under that customer's lock.
//! The cache is filled from durable reads and is never written by business
//! logic.

#![warn(missing_docs)]

pub mod batching;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod deduction;
pub mod error;
pub mod grant;
pub mod jobs;
pub mod metrics;
pub mod reset;
pub mod resolver;
pub mod rollover;
pub mod service;
pub mod store;
pub mod sync;
pub mod topup;

pub use batching::{BatchApplier, BatchKey, DeductionBatcher};
pub use cache::{BalanceCache, BalanceView, CacheKey, MokaBalanceCache};
pub use catalog::{FeatureCatalog, FeatureDefinition, FeatureKind, InMemoryCatalog};
pub use config::LedgerConfig;
pub use coordinator::{Coordinator, LockGuard, LockKey};
pub use deduction::{CreditKind, OverageBehaviour};
pub use error::{LedgerError, LedgerResult};
pub use grant::{EntitlementGrant, Interval};
pub use jobs::{InProcessQueue, Job, JobHandler, JobQueue, RecordingQueue};
pub use metrics::{LedgerMetrics, MetricsSnapshot};
pub use reset::{ResetOutcome, ResetScheduler, SweepReport};
pub use resolver::{BalanceQuery, FeatureBalance};
pub use rollover::{RolloverBucket, RolloverPolicy};
pub use service::{
    BalanceService, CreditReceipt, CreditRequest, LedgerDeps, SetBalanceReceipt, TrackReceipt, UsageEvent,
};
pub use store::{DurableStore, GrantFilter, InMemoryStore, TopupRecord};
pub use sync::{ConsistencySync, ReadMode};
pub use topup::{AutoTopupConfig, RecordingExecutor, ReplenishmentExecutor, TopupOutcome};
