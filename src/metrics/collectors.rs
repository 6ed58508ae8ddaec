//! Recording helpers for queue metrics.
//!
//! [`MetricsCollector`] wraps the raw Prometheus statics with the label
//! values the dispatcher and workers use. Every method silently does nothing
//! when metrics were never initialized.

use std::time::Duration;

use super::prometheus::{
    DISPATCH_DURATION, ENTRIES_PROCESSED, QUEUE_ENTRIES, STALE_RECLAIMED, WORKER_LAUNCHES,
};
use crate::storage::{EntryStatus, StatusCounts};

/// What happened to one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Completed,
    Failed,
    /// The terminal write matched no row; the lease had been reclaimed.
    Lost,
    /// Returned to pending unstarted because of shutdown.
    Released,
}

impl EntryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Lost => "lost",
            Self::Released => "released",
        }
    }
}

/// Metrics collector for dispatcher and worker events.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Sets the per-status queue gauges.
    pub fn record_queue_counts(&self, counts: &StatusCounts) {
        if let Some(gauge) = QUEUE_ENTRIES.get() {
            for status in EntryStatus::ALL {
                gauge
                    .with_label_values(&[status.as_str()])
                    .set(counts.get(status) as f64);
            }
            gauge
                .with_label_values(&["exhausted"])
                .set(counts.exhausted as f64);
        }
    }

    /// Records the pending gauge alone, as seen by a dispatch cycle.
    pub fn record_pending(&self, pending: u64) {
        if let Some(gauge) = QUEUE_ENTRIES.get() {
            gauge
                .with_label_values(&[EntryStatus::Pending.as_str()])
                .set(pending as f64);
        }
    }

    pub fn record_entry(&self, outcome: EntryOutcome) {
        self.record_entries(outcome, 1);
    }

    pub fn record_entries(&self, outcome: EntryOutcome, count: u64) {
        if count == 0 {
            return;
        }
        if let Some(counter) = ENTRIES_PROCESSED.get() {
            counter
                .with_label_values(&[outcome.as_str()])
                .inc_by(count as f64);
        }
    }

    pub fn record_launches(&self, launched: usize, failed: usize) {
        if let Some(counter) = WORKER_LAUNCHES.get() {
            if launched > 0 {
                counter
                    .with_label_values(&["launched"])
                    .inc_by(launched as f64);
            }
            if failed > 0 {
                counter.with_label_values(&["failed"]).inc_by(failed as f64);
            }
        }
    }

    pub fn record_stale_reclaimed(&self, count: u64) {
        if let Some(counter) = STALE_RECLAIMED.get() {
            counter.inc_by(count);
        }
    }

    pub fn record_dispatch_cycle(&self, ok: bool, elapsed: Duration) {
        if let Some(histogram) = DISPATCH_DURATION.get() {
            let result = if ok { "ok" } else { "error" };
            histogram
                .with_label_values(&[result])
                .observe(elapsed.as_secs_f64());
        }
    }
}
