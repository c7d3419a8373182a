//! Ledger configuration
//!
//! Every section has defaults so a partial TOML document is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::deduction::OverageBehaviour;

/// Top-level ledger configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Customer lock acquisition
    pub lock: LockConfig,
    /// Deduction batching
    pub batching: BatchConfig,
    /// Balance view cache
    pub cache: CacheConfig,
    /// Reset sweep
    pub reset: ResetConfig,
    /// Auto top-up jobs
    pub topup: TopupConfig,
    /// Deduction behaviour
    pub deduction: DeductionConfig,
}

/// Lock acquisition settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Attempts before reporting contention
    pub max_attempts: u32,
    /// First backoff (milliseconds)
    pub initial_backoff_ms: u64,
    /// Backoff ceiling (milliseconds)
    pub max_backoff_ms: u64,
}

impl LockConfig {
    /// First backoff as a duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff ceiling as a duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff_ms: 5,
            max_backoff_ms: 200,
        }
    }
}

/// Deduction batching settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Collection window (milliseconds)
    pub window_ms: u64,
    /// Flush early once a key holds this many requests
    pub max_batch: usize,
    /// Submission channel capacity
    pub channel_capacity: usize,
}

impl BatchConfig {
    /// Window as a duration
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: 10,
            max_batch: 64,
            channel_capacity: 1024,
        }
    }
}

/// Balance cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached views
    pub max_capacity: u64,
    /// View lifetime (seconds)
    pub ttl_secs: u64,
    /// Rebuild the customer view in the background after a write
    pub refresh_after_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            ttl_secs: 300,
            refresh_after_write: true,
        }
    }
}

/// Reset sweep settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Sweep period (seconds)
    pub sweep_interval_secs: u64,
    /// Customers handled per sweep
    pub batch_limit: usize,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            batch_limit: 500,
        }
    }
}

/// Auto top-up job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopupConfig {
    /// Delay before a contended job runs again (milliseconds)
    pub requeue_delay_ms: u64,
    /// Requeues before a job is dropped
    pub max_requeues: u32,
}

impl TopupConfig {
    /// Requeue delay as a duration
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for TopupConfig {
    fn default() -> Self {
        Self {
            requeue_delay_ms: 250,
            max_requeues: 5,
        }
    }
}

/// Deduction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeductionConfig {
    /// What to do with a shortfall when overage is not allowed
    pub overage: OverageBehaviour,
    /// Re-resolve attempts after a stale grant or version conflict
    pub persist_retries: u32,
}

impl Default for DeductionConfig {
    fn default() -> Self {
        Self {
            overage: OverageBehaviour::Reject,
            persist_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: LedgerConfig = serde_json::from_str(r#"{"lock": {"max_attempts": 3}}"#).unwrap();
        assert_eq!(config.lock.max_attempts, 3);
        assert_eq!(config.lock.initial_backoff_ms, 5);
        assert_eq!(config.batching, BatchConfig::default());
        assert_eq!(config.deduction.overage, OverageBehaviour::Reject);
    }

    #[test]
    fn test_durations() {
        let lock = LockConfig::default();
        assert_eq!(lock.initial_backoff(), Duration::from_millis(5));
        assert_eq!(lock.max_backoff(), Duration::from_millis(200));
        assert_eq!(TopupConfig::default().requeue_delay(), Duration::from_millis(250));
    }
}
