//! The batch worker.
//!
//! A worker lives for exactly one batch:
//!
//! ```text
//! START -> CLAIM -> NO_WORK_EXIT
//!                -> PROCESS_BATCH -> EXIT
//! ```
//!
//! Each claimed row is processed concurrently and independently; one row's
//! failure never affects its siblings. Terminal writes are fenced on the
//! worker's owner id, so a row reclaimed out from under a slow worker is
//! reported as lost instead of being overwritten.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use super::processor::{EntryProcessor, ProcessRequest};
use super::shutdown::Shutdown;
use crate::error::ProvisionError;
use crate::metrics::{EntryOutcome, MetricsCollector};
use crate::storage::{truncate_error_message, ClaimedEntry, QueueError, QueueStore};

/// Errors that end a worker run.
///
/// Row-level processing errors never appear here; they are written to the
/// row instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Worker exceeded its wall-clock budget of {0:?}")]
    WallClockExceeded(Duration),
}

/// Configuration for one worker run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Owner id recorded on every claimed row.
    pub owner_id: String,
    /// Maximum rows to claim.
    pub batch_size: usize,
    /// Budget for the whole run.
    pub wall_clock_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            owner_id: String::new(),
            batch_size: 8,
            wall_clock_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_wall_clock_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = timeout;
        self
    }
}

/// Per-batch counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Terminal write matched nothing: the lease had been reclaimed.
    pub lost: usize,
    /// Terminal write errored; the row stays `processing` until reclaimed.
    pub unrecorded: usize,
    /// Not started because of shutdown and returned to `pending`.
    pub released: usize,
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Nothing was claimable.
    NoWork,
    /// A batch was claimed and processed.
    Processed(BatchSummary),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowResult {
    Completed,
    Failed,
    Lost,
    Unrecorded,
    Skipped(i64),
}

/// Claims and processes one batch.
pub struct Worker {
    store: Arc<dyn QueueStore>,
    processor: Arc<dyn EntryProcessor>,
    config: WorkerConfig,
    metrics: MetricsCollector,
}

impl Worker {
    pub fn new(
        store: Arc<dyn QueueStore>,
        processor: Arc<dyn EntryProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Runs the worker within its wall-clock budget.
    ///
    /// When the budget runs out, in-flight rows are abandoned in `processing`
    /// and a later dispatch cycle reclaims them.
    pub async fn run(&self, shutdown: Shutdown) -> Result<WorkerOutcome, WorkerError> {
        let budget = self.config.wall_clock_timeout;
        match tokio::time::timeout(budget, self.run_batch(shutdown)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    owner = %self.config.owner_id,
                    budget_secs = budget.as_secs(),
                    "Worker exceeded wall-clock budget"
                );
                Err(WorkerError::WallClockExceeded(budget))
            }
        }
    }

    async fn run_batch(&self, shutdown: Shutdown) -> Result<WorkerOutcome, WorkerError> {
        let owner = &self.config.owner_id;

        if shutdown.is_requested() {
            info!(owner = %owner, "Shutdown requested before claim");
            return Ok(WorkerOutcome::NoWork);
        }

        let entries = self.store.claim_batch(owner, self.config.batch_size).await?;
        if entries.is_empty() {
            info!(owner = %owner, "No entries to process");
            return Ok(WorkerOutcome::NoWork);
        }

        info!(owner = %owner, count = entries.len(), "Starting to process entries");
        let summary = self.process_batch(entries, &shutdown).await?;
        Ok(WorkerOutcome::Processed(summary))
    }

    /// Processes `entries` concurrently and returns the aggregate counts.
    ///
    /// Rows not yet started when shutdown is requested are released back to
    /// `pending`.
    pub async fn process_batch(
        &self,
        entries: Vec<ClaimedEntry>,
        shutdown: &Shutdown,
    ) -> Result<BatchSummary, WorkerError> {
        let started = Instant::now();
        let mut summary = BatchSummary {
            claimed: entries.len(),
            ..Default::default()
        };

        let results = join_all(entries.into_iter().map(|entry| async move {
            if shutdown.is_requested() {
                return RowResult::Skipped(entry.id);
            }
            self.process_row(entry).await
        }))
        .await;

        let mut skipped = Vec::new();
        for result in results {
            match result {
                RowResult::Completed => summary.completed += 1,
                RowResult::Failed => summary.failed += 1,
                RowResult::Lost => summary.lost += 1,
                RowResult::Unrecorded => summary.unrecorded += 1,
                RowResult::Skipped(id) => skipped.push(id),
            }
        }

        if !skipped.is_empty() {
            let released = self.store.release(&skipped, &self.config.owner_id).await?;
            summary.released = usize::try_from(released).unwrap_or(skipped.len());
            self.metrics.record_entries(EntryOutcome::Released, released);
            info!(
                owner = %self.config.owner_id,
                released,
                "Released unstarted entries on shutdown"
            );
        }

        info!(
            owner = %self.config.owner_id,
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            lost = summary.lost,
            released = summary.released,
            duration_ms = started.elapsed().as_millis() as u64,
            "Batch processing completed"
        );

        Ok(summary)
    }

    async fn process_row(&self, entry: ClaimedEntry) -> RowResult {
        let owner = &self.config.owner_id;
        let id = entry.id;

        let outcome = match ProcessRequest::from_entry(&entry, owner) {
            Ok(request) => self.processor.process(&request).await,
            Err(e) => Err(e),
        };

        let write = match &outcome {
            Ok(_) => self.store.mark_completed(id, owner).await,
            Err(e) => {
                warn!(entry_id = id, error = %e, "Failed to process entry");
                let message = truncate_error_message(&e.to_string());
                self.store.mark_failed(id, owner, &message).await
            }
        };

        let result = match (write, outcome.is_ok()) {
            (Ok(true), true) => RowResult::Completed,
            (Ok(true), false) => RowResult::Failed,
            (Ok(false), _) => {
                warn!(
                    entry_id = id,
                    owner = %owner,
                    "Lease lost before terminal write; row left as is"
                );
                RowResult::Lost
            }
            (Err(e), _) => {
                error!(entry_id = id, error = %e, "Failed to record entry outcome");
                RowResult::Unrecorded
            }
        };

        match result {
            RowResult::Completed => self.metrics.record_entry(EntryOutcome::Completed),
            RowResult::Failed => self.metrics.record_entry(EntryOutcome::Failed),
            RowResult::Lost => self.metrics.record_entry(EntryOutcome::Lost),
            RowResult::Unrecorded | RowResult::Skipped(_) => {}
        }
        result
    }
}
