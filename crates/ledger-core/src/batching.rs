//! Deduction batching
//!
//! Small deductions for the same (customer, feature, entity) arriving within
//! a short window are applied under one lock acquisition and one commit.
//!
//! ```text
//! submit ─► mpsc ─► worker: open batch per key ─┬─ window elapsed ─► apply_batch ─► oneshot replies
//!                                               └─ max_batch hit ──┘
//! ```
//!
//! Requests keep their enqueue order within a batch, and each gets its own
//! result: once the balance runs out, that request and every later one in
//! the batch fail.
//!
//! Each flush runs on its own task so a slow commit for one key never holds
//! up another. A key has at most one flush in flight; requests arriving
//! meanwhile collect in the next batch, which starts as soon as the running
//! one reports back.

use async_trait::async_trait;
use ledger_common::{CustomerId, EntityId, FeatureId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::debug;

use crate::config::BatchConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::metrics::LedgerMetrics;
use crate::service::TrackReceipt;

/// Requests sharing a key share a batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    pub entity_id: Option<EntityId>,
}

impl BatchKey {
    pub fn new(customer_id: CustomerId, feature_id: FeatureId, entity_id: Option<EntityId>) -> Self {
        Self {
            customer_id,
            feature_id,
            entity_id,
        }
    }
}

/// Applies a whole batch atomically, one result per amount in order
#[async_trait]
pub trait BatchApplier: Send + Sync {
    async fn apply_batch(&self, key: &BatchKey, amounts: Vec<Decimal>) -> Vec<LedgerResult<TrackReceipt>>;
}

struct Pending {
    key: BatchKey,
    amount: Decimal,
    reply: oneshot::Sender<LedgerResult<TrackReceipt>>,
}

struct OpenBatch {
    opened: Instant,
    items: Vec<(Decimal, oneshot::Sender<LedgerResult<TrackReceipt>>)>,
}

/// Flushes currently running, one per key
struct InFlight {
    applier: Arc<dyn BatchApplier>,
    metrics: Arc<LedgerMetrics>,
    keys: HashSet<BatchKey>,
    done: mpsc::UnboundedSender<BatchKey>,
}

impl InFlight {
    /// Start flushing the open batch for `key` unless one is already running
    fn start(&mut self, open: &mut HashMap<BatchKey, OpenBatch>, key: &BatchKey) {
        if self.keys.contains(key) {
            return;
        }
        let Some(batch) = open.remove(key) else {
            return;
        };
        self.keys.insert(key.clone());
        let applier = Arc::clone(&self.applier);
        let metrics = Arc::clone(&self.metrics);
        let finished = Finished {
            key: Some(key.clone()),
            done: self.done.clone(),
        };
        let key = key.clone();
        tokio::spawn(async move {
            let _finished = finished;
            DeductionBatcher::flush(applier.as_ref(), key, batch, &metrics).await;
        });
    }
}

/// Reports a key as free when the flush task ends, even by panic
struct Finished {
    key: Option<BatchKey>,
    done: mpsc::UnboundedSender<BatchKey>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.done.send(key);
        }
    }
}

/// Front door of the batching stage
#[derive(Clone)]
pub struct DeductionBatcher {
    sender: mpsc::Sender<Pending>,
}

impl DeductionBatcher {
    /// Spawn the worker; it stops once every batcher handle is dropped
    pub fn start(
        applier: Arc<dyn BatchApplier>,
        config: BatchConfig,
        metrics: Arc<LedgerMetrics>,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let worker = tokio::spawn(Self::worker_loop(receiver, applier, config, metrics));
        (Self { sender }, worker)
    }

    /// Deduct `amount` as part of the next batch for `key`
    pub async fn submit(&self, key: BatchKey, amount: Decimal) -> LedgerResult<TrackReceipt> {
        let (reply, result) = oneshot::channel();
        self.sender
            .send(Pending { key, amount, reply })
            .await
            .map_err(|_| LedgerError::Unavailable("deduction batcher stopped".into()))?;
        result
            .await
            .map_err(|_| LedgerError::Unavailable("deduction batch dropped".into()))?
    }

    async fn worker_loop(
        mut receiver: mpsc::Receiver<Pending>,
        applier: Arc<dyn BatchApplier>,
        config: BatchConfig,
        metrics: Arc<LedgerMetrics>,
    ) {
        let window = config.window();
        let max_batch = config.max_batch.max(1);
        let mut open: HashMap<BatchKey, OpenBatch> = HashMap::new();
        let (done, mut finished) = mpsc::unbounded_channel();
        let mut in_flight = InFlight {
            applier,
            metrics,
            keys: HashSet::new(),
            done,
        };
        let mut closed = false;
        let mut ticker = tokio::time::interval(window.max(std::time::Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = receiver.recv(), if !closed => match received {
                    Some(pending) => {
                        let batch = open.entry(pending.key.clone()).or_insert_with(|| OpenBatch {
                            opened: Instant::now(),
                            items: Vec::new(),
                        });
                        batch.items.push((pending.amount, pending.reply));
                        if batch.items.len() >= max_batch {
                            in_flight.start(&mut open, &pending.key);
                        }
                    }
                    None => {
                        closed = true;
                        let keys: Vec<BatchKey> = open.keys().cloned().collect();
                        for key in keys {
                            in_flight.start(&mut open, &key);
                        }
                    }
                },
                Some(key) = finished.recv() => {
                    in_flight.keys.remove(&key);
                    let ready = open.get(&key).is_some_and(|batch| {
                        closed || batch.items.len() >= max_batch || batch.opened.elapsed() >= window
                    });
                    if ready {
                        in_flight.start(&mut open, &key);
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let due: Vec<BatchKey> = open
                        .iter()
                        .filter(|(_, batch)| now.duration_since(batch.opened) >= window)
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in due {
                        in_flight.start(&mut open, &key);
                    }
                }
            }
            if closed && open.is_empty() && in_flight.keys.is_empty() {
                break;
            }
        }
    }

    async fn flush(applier: &dyn BatchApplier, key: BatchKey, batch: OpenBatch, metrics: &LedgerMetrics) {
        let (amounts, replies): (Vec<_>, Vec<_>) = batch.items.into_iter().unzip();
        debug!(customer = %key.customer_id, feature = %key.feature_id, size = amounts.len(), "flushing batch");
        let results = applier.apply_batch(&key, amounts).await;
        metrics.batches_flushed.inc();
        for (reply, result) in replies.into_iter().zip(results) {
            // caller may have given up waiting
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct Recorder {
        batches: Mutex<Vec<Vec<Decimal>>>,
    }

    #[async_trait]
    impl BatchApplier for Recorder {
        async fn apply_batch(&self, key: &BatchKey, amounts: Vec<Decimal>) -> Vec<LedgerResult<TrackReceipt>> {
            self.batches.lock().push(amounts.clone());
            amounts
                .into_iter()
                .map(|amount| {
                    if amount > dec!(100) {
                        Err(LedgerError::InvalidAmount("too large".into()))
                    } else {
                        Ok(TrackReceipt::applied(key, amount))
                    }
                })
                .collect()
        }
    }

    fn key() -> BatchKey {
        BatchKey::new(
            CustomerId::new("cus_1").unwrap(),
            FeatureId::new("messages").unwrap(),
            None,
        )
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder {
            batches: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_in_window_share_one_batch() {
        let applier = recorder();
        let metrics = Arc::new(LedgerMetrics::new());
        let (batcher, _worker) = DeductionBatcher::start(applier.clone(), BatchConfig::default(), metrics.clone());

        let (a, b, c) = tokio::join!(
            batcher.submit(key(), dec!(1)),
            batcher.submit(key(), dec!(200)),
            batcher.submit(key(), dec!(3)),
        );
        assert_eq!(a.unwrap().deducted, dec!(1));
        assert!(b.is_err());
        assert_eq!(c.unwrap().deducted, dec!(3));
        assert_eq!(applier.batches.lock().as_slice(), &[vec![dec!(1), dec!(200), dec!(3)]]);
        assert_eq!(metrics.batches_flushed.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_early() {
        let applier = recorder();
        let config = BatchConfig {
            window_ms: 60_000,
            max_batch: 2,
            channel_capacity: 8,
        };
        let (batcher, _worker) = DeductionBatcher::start(applier.clone(), config, Arc::new(LedgerMetrics::new()));
        let (a, b) = tokio::join!(batcher.submit(key(), dec!(1)), batcher.submit(key(), dec!(2)));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(applier.batches.lock().len(), 1);
    }

    /// Applier that stalls one customer and records completion order
    struct Stalling {
        slow: CustomerId,
        finished: Mutex<Vec<CustomerId>>,
        running: Mutex<HashSet<BatchKey>>,
        overlapped: Mutex<bool>,
    }

    #[async_trait]
    impl BatchApplier for Stalling {
        async fn apply_batch(&self, key: &BatchKey, amounts: Vec<Decimal>) -> Vec<LedgerResult<TrackReceipt>> {
            if !self.running.lock().insert(key.clone()) {
                *self.overlapped.lock() = true;
            }
            if key.customer_id == self.slow {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
            self.running.lock().remove(key);
            self.finished.lock().push(key.customer_id.clone());
            amounts.into_iter().map(|amount| Ok(TrackReceipt::applied(key, amount))).collect()
        }
    }

    fn stalling() -> Arc<Stalling> {
        Arc::new(Stalling {
            slow: CustomerId::new("cus_slow").unwrap(),
            finished: Mutex::new(Vec::new()),
            running: Mutex::new(HashSet::new()),
            overlapped: Mutex::new(false),
        })
    }

    fn slow_key() -> BatchKey {
        BatchKey::new(
            CustomerId::new("cus_slow").unwrap(),
            FeatureId::new("messages").unwrap(),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_customer_does_not_hold_up_others() {
        let applier = stalling();
        let (batcher, _worker) = DeductionBatcher::start(applier.clone(), BatchConfig::default(), Arc::new(LedgerMetrics::new()));

        let slow = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.submit(slow_key(), dec!(1)).await })
        };
        // let the slow batch close and start applying
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let started = Instant::now();
        assert_eq!(batcher.submit(key(), dec!(2)).await.unwrap().deducted, dec!(2));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(applier.finished.lock().as_slice(), &[key().customer_id]);

        assert_eq!(slow.await.unwrap().unwrap().deducted, dec!(1));
        assert_eq!(applier.finished.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_flush_in_flight_per_key() {
        let applier = stalling();
        let (batcher, _worker) = DeductionBatcher::start(applier.clone(), BatchConfig::default(), Arc::new(LedgerMetrics::new()));

        let first = {
            let batcher = batcher.clone();
            tokio::spawn(async move { batcher.submit(slow_key(), dec!(1)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (second, third) = tokio::join!(batcher.submit(slow_key(), dec!(2)), batcher.submit(slow_key(), dec!(3)));

        assert!(first.await.unwrap().is_ok());
        assert!(second.is_ok() && third.is_ok());
        assert!(!*applier.overlapped.lock());
        // the two late requests waited out the first flush together
        assert_eq!(applier.finished.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_stopped_batcher_is_unavailable() {
        let (batcher, worker) = DeductionBatcher::start(recorder(), BatchConfig::default(), Arc::new(LedgerMetrics::new()));
        worker.abort();
        let _ = worker.await;
        let err = batcher.submit(key(), dec!(1)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }
}
