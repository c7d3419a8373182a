//! Ledger counters
//!
//! Every counter only grows; [`LedgerMetrics::snapshot`] copies them into a
//! serializable [`MetricsSnapshot`] for export.

use ledger_common::EventCounter;
use serde::{Deserialize, Serialize};

/// Lock-free ledger counters
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    /// Usage amounts applied, overage included
    pub deductions: EventCounter,
    /// Refunds and adjustments applied
    pub credits: EventCounter,
    /// Deductions that could not be fully covered
    pub shortfalls: EventCounter,
    /// Deductions that drove a balance negative
    pub overages: EventCounter,
    /// Customer locks given up after the retry budget
    pub lock_contentions: EventCounter,
    /// Operations re-resolved after a stale snapshot or version conflict
    pub stale_retries: EventCounter,
    /// Grants reset at the end of a cycle
    pub resets: EventCounter,
    /// Rollover buckets opened by resets
    pub rollovers_created: EventCounter,
    /// Auto top-up jobs enqueued
    pub topups_scheduled: EventCounter,
    /// Top-up purchases credited
    pub topups_executed: EventCounter,
    /// Top-up jobs that bought nothing: healthy balance, limit, disabled or dropped
    pub topups_skipped: EventCounter,
    /// Top-ups declined by the executor or bought but not credited
    pub topups_failed: EventCounter,
    /// Deduction batches applied
    pub batches_flushed: EventCounter,
    /// Balance reads served from the cache
    pub cache_hits: EventCounter,
    /// Balance reads that went to the store
    pub cache_misses: EventCounter,
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            deductions: self.deductions.get(),
            credits: self.credits.get(),
            shortfalls: self.shortfalls.get(),
            overages: self.overages.get(),
            lock_contentions: self.lock_contentions.get(),
            stale_retries: self.stale_retries.get(),
            resets: self.resets.get(),
            rollovers_created: self.rollovers_created.get(),
            topups_scheduled: self.topups_scheduled.get(),
            topups_executed: self.topups_executed.get(),
            topups_skipped: self.topups_skipped.get(),
            topups_failed: self.topups_failed.get(),
            batches_flushed: self.batches_flushed.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
        }
    }
}

/// Serializable counter values, one field per [`LedgerMetrics`] counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// See [`LedgerMetrics::deductions`]
    pub deductions: u64,
    /// See [`LedgerMetrics::credits`]
    pub credits: u64,
    /// See [`LedgerMetrics::shortfalls`]
    pub shortfalls: u64,
    /// See [`LedgerMetrics::overages`]
    pub overages: u64,
    /// See [`LedgerMetrics::lock_contentions`]
    pub lock_contentions: u64,
    /// See [`LedgerMetrics::stale_retries`]
    pub stale_retries: u64,
    /// See [`LedgerMetrics::resets`]
    pub resets: u64,
    /// See [`LedgerMetrics::rollovers_created`]
    pub rollovers_created: u64,
    /// See [`LedgerMetrics::topups_scheduled`]
    pub topups_scheduled: u64,
    /// See [`LedgerMetrics::topups_executed`]
    pub topups_executed: u64,
    /// See [`LedgerMetrics::topups_skipped`]
    pub topups_skipped: u64,
    /// See [`LedgerMetrics::topups_failed`]
    pub topups_failed: u64,
    /// See [`LedgerMetrics::batches_flushed`]
    pub batches_flushed: u64,
    /// See [`LedgerMetrics::cache_hits`]
    pub cache_hits: u64,
    /// See [`LedgerMetrics::cache_misses`]
    pub cache_misses: u64,
}

impl MetricsSnapshot {
    /// Cache hit ratio, zero before the first read
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = LedgerMetrics::new();
        metrics.deductions.inc();
        metrics.cache_hits.add(3);
        metrics.cache_misses.inc();

        let snap = metrics.snapshot();
        assert_eq!(snap.deductions, 1);
        assert_eq!(snap.cache_hit_ratio(), 0.75);
        assert_eq!(MetricsSnapshot::default().cache_hit_ratio(), 0.0);
    }
}
