//! Prometheus metrics registration and export.
//!
//! Every metric lives in a `OnceLock` static so recording is a no-op until
//! [`init_metrics`] has run. Short-lived worker processes never initialize
//! them; `dispatch --loop --metrics-addr` and `stats --format prometheus` do.

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Rows in the queue table, labeled by status.
pub static QUEUE_ENTRIES: OnceLock<GaugeVec> = OnceLock::new();

/// Rows handled by workers, labeled by outcome
/// (`completed`, `failed`, `lost`, `released`).
pub static ENTRIES_PROCESSED: OnceLock<CounterVec> = OnceLock::new();

/// Worker launches, labeled by result (`launched`, `failed`).
pub static WORKER_LAUNCHES: OnceLock<CounterVec> = OnceLock::new();

/// Stale rows reset to pending by dispatch cycles.
pub static STALE_RECLAIMED: OnceLock<IntCounter> = OnceLock::new();

/// Dispatch cycle duration in seconds, labeled by result (`ok`, `error`).
pub static DISPATCH_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first set of metrics.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let queue_entries = GaugeVec::new(
        Opts::new("queue_dispatch_entries", "Rows in the queue table by status"),
        &["status"],
    )?;

    let entries_processed = CounterVec::new(
        Opts::new(
            "queue_dispatch_entries_processed_total",
            "Rows handled by workers by outcome",
        ),
        &["outcome"],
    )?;

    let worker_launches = CounterVec::new(
        Opts::new("queue_dispatch_worker_launches_total", "Worker launches by result"),
        &["result"],
    )?;

    let stale_reclaimed = IntCounter::new(
        "queue_dispatch_stale_reclaimed_total",
        "Stale rows reset to pending",
    )?;

    let dispatch_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "queue_dispatch_cycle_duration_seconds",
            "Dispatch cycle duration in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["result"],
    )?;

    registry.register(Box::new(queue_entries.clone()))?;
    registry.register(Box::new(entries_processed.clone()))?;
    registry.register(Box::new(worker_launches.clone()))?;
    registry.register(Box::new(stale_reclaimed.clone()))?;
    registry.register(Box::new(dispatch_duration.clone()))?;

    // A racing initializer may win; its metrics are equivalent.
    let _ = REGISTRY.set(registry);
    let _ = QUEUE_ENTRIES.set(queue_entries);
    let _ = ENTRIES_PROCESSED.set(entries_processed);
    let _ = WORKER_LAUNCHES.set(worker_launches);
    let _ = STALE_RECLAIMED.set(stale_reclaimed);
    let _ = DISPATCH_DURATION.set(dispatch_duration);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Handler for the `/metrics` route.
pub async fn metrics_handler() -> String {
    export_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_after_init() {
        init_metrics().unwrap();
        if let Some(counter) = STALE_RECLAIMED.get() {
            counter.inc_by(2);
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("queue_dispatch_stale_reclaimed_total"));
    }
}
