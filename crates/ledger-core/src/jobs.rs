//! Async job queue boundary
//!
//! Delivery is at-least-once; handlers must tolerate duplicates. The
//! in-process queue runs each job on its own task so duplicates really do
//! race, the same as with several external workers.

use async_trait::async_trait;
use ledger_common::{CustomerId, FeatureId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{LedgerError, LedgerResult};

/// Background work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// Re-check a balance and top it up if still low
    AutoTopup {
        customer_id: CustomerId,
        feature_id: FeatureId,
        /// Requeues so far
        attempt: u32,
    },
    /// Run one reset sweep
    ResetSweep,
}

/// Accepts jobs for later execution
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Deliver `job` after `delay`
    async fn enqueue(&self, job: Job, delay: Duration) -> LedgerResult<()>;
}

/// Executes delivered jobs
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> LedgerResult<()>;
}

/// Tokio channel queue with delayed delivery
pub struct InProcessQueue {
    sender: mpsc::UnboundedSender<Job>,
}

impl InProcessQueue {
    /// Queue and the receiver to hand to [`InProcessQueue::start`]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Run the worker loop until every sender is gone
    pub fn start(receiver: mpsc::UnboundedReceiver<Job>, handler: Arc<dyn JobHandler>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(Self::worker_loop(receiver, handler))
    }

    async fn worker_loop(mut receiver: mpsc::UnboundedReceiver<Job>, handler: Arc<dyn JobHandler>) {
        while let Some(job) = receiver.recv().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                debug!(job = ?job, "running job");
                if let Err(e) = handler.handle(job.clone()).await {
                    warn!(job = ?job, error = %e, "job failed");
                }
            });
        }
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> LedgerResult<()> {
        if delay.is_zero() {
            return self
                .sender
                .send(job)
                .map_err(|_| LedgerError::Unavailable("job queue closed".into()));
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job).is_err() {
                warn!("job queue closed before delayed delivery");
            }
        });
        Ok(())
    }
}

/// Queue that only records, for callers that drain jobs themselves
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<VecDeque<(Job, Duration)>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded job in enqueue order
    pub fn drain(&self) -> Vec<Job> {
        self.jobs.lock().drain(..).map(|(job, _)| job).collect()
    }

    /// Recorded jobs with their delays
    pub fn pending(&self) -> Vec<(Job, Duration)> {
        self.jobs.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> LedgerResult<()> {
        self.jobs.lock().push_back((job, delay));
        Ok(())
    }
}
