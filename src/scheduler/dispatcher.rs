//! The dispatcher: one scaling decision per cycle.
//!
//! A cycle reclaims stale leases, optionally requeues failed rows, counts
//! claimable rows and launches enough workers to drain them, up to
//! `max_workers`. The dispatcher never touches row payloads and never talks
//! to workers after launch; all coordination goes through the queue table.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::shutdown::Shutdown;
use crate::execution::{LaunchRequest, LaunchedWorker, WorkerLauncher};
use crate::metrics::MetricsCollector;
use crate::storage::{QueueError, QueueStore};

/// Errors that abort a dispatch cycle.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deployment environment, the prefix of every owner id.
    pub environment: String,
    /// Rows each worker claims.
    pub batch_size: usize,
    /// Cap on launches per cycle.
    pub max_workers: usize,
    /// Claim age after which a `processing` row is reclaimed.
    pub stale_threshold: Duration,
    /// Interval between cycles in loop mode.
    pub interval: Duration,
    /// Requeue `failed` rows below the retry ceiling each cycle.
    pub retry_failed: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            batch_size: 8,
            max_workers: 25,
            stale_threshold: Duration::from_secs(30 * 60),
            interval: Duration::from_secs(60),
            retry_failed: false,
        }
    }
}

impl DispatcherConfig {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }
}

/// The scaling decision of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchDecision {
    pub pending_count: u64,
    pub workers_needed: usize,
}

impl DispatchDecision {
    pub fn new(pending_count: u64, batch_size: usize, max_workers: usize) -> Self {
        Self {
            pending_count,
            workers_needed: compute_workers_needed(pending_count, batch_size, max_workers),
        }
    }
}

/// `min(ceil(pending / batch_size), max_workers)`, and 0 when nothing is pending.
pub fn compute_workers_needed(pending: u64, batch_size: usize, max_workers: usize) -> usize {
    if pending == 0 || batch_size == 0 {
        return 0;
    }
    let needed = pending.div_ceil(batch_size as u64);
    usize::try_from(needed).unwrap_or(usize::MAX).min(max_workers)
}

/// A fresh owner id: `{environment}-{YYYYmmddHHMMSS}-{8 hex chars}`.
pub fn new_owner_id(environment: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        environment,
        Utc::now().format("%Y%m%d%H%M%S"),
        &suffix[..8]
    )
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub pending_entries: u64,
    pub stale_entries_reset: u64,
    pub requeued_failed: u64,
    pub workers_launched: usize,
    pub launch_failures: usize,
    pub workers: Vec<LaunchedWorker>,
}

/// Periodic scaling controller.
pub struct Dispatcher {
    store: Arc<dyn QueueStore>,
    launcher: Arc<dyn WorkerLauncher>,
    config: DispatcherConfig,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn QueueStore>,
        launcher: Arc<dyn WorkerLauncher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            launcher,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Runs one dispatch cycle.
    ///
    /// # Errors
    ///
    /// Any queue-store error aborts the cycle. Launch errors do not; they are
    /// counted in the report.
    pub async fn run_cycle(&self) -> Result<DispatchReport, DispatchError> {
        let started = Instant::now();
        let result = self.cycle().await;
        self.metrics.record_dispatch_cycle(result.is_ok(), started.elapsed());
        result
    }

    async fn cycle(&self) -> Result<DispatchReport, DispatchError> {
        let stale_entries_reset = self.store.reclaim_stale(self.config.stale_threshold).await?;
        self.metrics.record_stale_reclaimed(stale_entries_reset);

        let requeued_failed = if self.config.retry_failed {
            self.store.requeue_failed().await?
        } else {
            0
        };

        let pending = self.store.count_claimable().await?;
        self.metrics.record_pending(pending);

        let decision =
            DispatchDecision::new(pending, self.config.batch_size, self.config.max_workers);
        info!(
            pending = decision.pending_count,
            workers_needed = decision.workers_needed,
            stale_reset = stale_entries_reset,
            requeued = requeued_failed,
            "Dispatch decision"
        );

        let (workers, launch_failures) = self.launch_workers(decision.workers_needed).await;

        Ok(DispatchReport {
            pending_entries: pending,
            stale_entries_reset,
            requeued_failed,
            workers_launched: workers.len(),
            launch_failures,
            workers,
        })
    }

    /// Launches `n` workers, each with a fresh owner id.
    ///
    /// Returns the workers that started and the number of failed launches.
    pub async fn launch_workers(&self, n: usize) -> (Vec<LaunchedWorker>, usize) {
        let mut launched = Vec::with_capacity(n);
        let mut failures = 0;

        for index in 0..n {
            let owner_id = new_owner_id(&self.config.environment);
            let request = LaunchRequest::new(owner_id, self.config.batch_size);
            match self.launcher.launch(&request).await {
                Ok(worker) => {
                    info!(handle = %worker.handle, owner = %worker.owner, "Launched worker");
                    launched.push(worker);
                }
                Err(e) => {
                    failures += 1;
                    error!(index, owner = %request.owner_id, error = %e, "Failed to launch worker");
                }
            }
        }

        self.metrics.record_launches(launched.len(), failures);
        if failures > 0 {
            warn!(launched = launched.len(), failures, "Some worker launches failed");
        }
        (launched, failures)
    }

    /// Runs cycles on `config.interval` until shutdown.
    ///
    /// A failed cycle is logged and the next tick tries again. Ticks never
    /// overlap; a slow cycle skips missed ticks.
    pub async fn run_forever(&self, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            environment = %self.config.environment,
            "Dispatcher loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.requested() => break,
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) => info!(
                    pending = report.pending_entries,
                    launched = report.workers_launched,
                    "Dispatch cycle complete"
                ),
                Err(e) => error!(error = %e, "Dispatch cycle failed"),
            }
        }

        info!("Dispatcher loop stopped");
    }
}
