//! Prometheus metrics for the queue.
//!
//! # Example
//!
//! ```ignore
//! use queue_dispatch::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! let counts = store.status_counts().await?;
//! MetricsCollector::new().record_queue_counts(&counts);
//! print!("{}", export_metrics());
//! ```

pub mod collectors;
pub mod prometheus;
pub mod server;

pub use collectors::{EntryOutcome, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};
pub use server::MetricsServer;

pub use prometheus::{
    DISPATCH_DURATION, ENTRIES_PROCESSED, QUEUE_ENTRIES, REGISTRY, STALE_RECLAIMED,
    WORKER_LAUNCHES,
};
