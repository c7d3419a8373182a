//! CLI Commands

pub mod balance;
pub mod config;
pub mod sweep;
pub mod usage;

use anyhow::Context as _;
use ledger_common::{Clock, CustomerId, EntityId, FeatureId, ManualClock, SystemClock, Timestamp};
use ledger_core::{
    AutoTopupConfig, BalanceService, DurableStore, EntitlementGrant, FeatureDefinition, InMemoryCatalog,
    InMemoryStore, LedgerConfig, LedgerDeps, MokaBalanceCache, RecordingExecutor, RecordingQueue, TopupRecord,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::output::OutputFormat;

/// Global options shared by every command
pub struct Context {
    pub snapshot: Option<PathBuf>,
    pub write: bool,
    pub at: Option<i64>,
    pub config: LedgerConfig,
    pub format: OutputFormat,
}

/// Top-up controls of one customer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerTopup {
    pub customer_id: CustomerId,
    #[serde(flatten)]
    pub config: AutoTopupConfig,
}

/// On-disk ledger state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub features: Vec<FeatureDefinition>,
    pub topups: Vec<CustomerTopup>,
    pub purchases: Vec<TopupRecord>,
    pub grants: Vec<EntitlementGrant>,
}

impl Snapshot {
    /// Read a snapshot; a missing file is an empty ledger
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))
    }
}

/// Service wired to in-memory boundaries seeded from a snapshot
pub struct Ledger {
    pub service: BalanceService,
    store: Arc<InMemoryStore>,
    jobs: Arc<RecordingQueue>,
    features: Vec<FeatureDefinition>,
    topups: Vec<CustomerTopup>,
}

impl Ledger {
    pub async fn open(ctx: &Context) -> anyhow::Result<Self> {
        let snapshot = match &ctx.snapshot {
            Some(path) => Snapshot::read(path)?,
            None => Snapshot::default(),
        };
        let clock: Arc<dyn Clock> = match ctx.at {
            Some(millis) => Arc::new(ManualClock::new(Timestamp::from_millis(millis))),
            None => Arc::new(SystemClock),
        };
        Self::from_snapshot(snapshot, ctx.config.clone(), clock).await
    }

    pub async fn from_snapshot(
        snapshot: Snapshot,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let Snapshot {
            features,
            topups,
            purchases,
            grants,
        } = snapshot;

        let store = Arc::new(InMemoryStore::with_grants(grants));
        for (n, mut purchase) in purchases.into_iter().enumerate() {
            if purchase.idempotency_key.is_empty() {
                purchase.idempotency_key = format!("imported/{n}");
            }
            store.record_topup(purchase).await?;
        }

        let catalog = Arc::new(InMemoryCatalog::new());
        for feature in &features {
            catalog.upsert_feature(feature.clone());
        }
        for topup in &topups {
            catalog.set_auto_topup(topup.customer_id.clone(), topup.config.clone());
        }
        debug!(features = features.len(), topups = topups.len(), "ledger opened");

        let jobs = Arc::new(RecordingQueue::new());
        let deps = LedgerDeps {
            store: store.clone(),
            catalog,
            cache: Arc::new(MokaBalanceCache::new(&config.cache)),
            jobs: jobs.clone(),
            executor: Arc::new(RecordingExecutor::new()),
            clock,
        };

        Ok(Self {
            service: BalanceService::new(deps, config),
            store,
            jobs,
            features,
            topups,
        })
    }

    /// Run queued jobs, including any they enqueue, until the queue is empty
    pub async fn drain_jobs(&self) -> usize {
        let mut ran = 0;
        loop {
            let jobs = self.jobs.drain();
            if jobs.is_empty() {
                return ran;
            }
            for job in jobs {
                ran += 1;
                if let Err(e) = self.service.handle_job(job).await {
                    warn!(error = %e, "job failed");
                }
            }
        }
    }

    /// Current state as a snapshot
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            features: self.features.clone(),
            topups: self.topups.clone(),
            purchases: self.store.topup_log(),
            grants: self.store.export(),
        }
    }

    /// Persist the snapshot if the caller asked for it
    pub fn save(&self, ctx: &Context) -> anyhow::Result<()> {
        match (&ctx.snapshot, ctx.write) {
            (Some(path), true) => self.snapshot().write(path),
            (None, true) => anyhow::bail!("--write needs --snapshot"),
            _ => Ok(()),
        }
    }
}

pub fn customer_scope(
    customer: &str,
    entity: Option<&str>,
) -> anyhow::Result<(CustomerId, Option<EntityId>)> {
    Ok((CustomerId::new(customer)?, entity.map(EntityId::new).transpose()?))
}

pub fn feature_id(feature: &str) -> anyhow::Result<FeatureId> {
    Ok(FeatureId::new(feature)?)
}
