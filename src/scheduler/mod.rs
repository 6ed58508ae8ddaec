//! Lease-based dispatch over the queue table.
//!
//! - **Dispatcher**: reclaims stale leases and launches workers sized to the
//!   backlog
//! - **Worker**: claims one batch, processes it concurrently, writes terminal
//!   statuses
//! - **Processor**: the external call made for each row
//! - **Shutdown**: SIGINT/SIGTERM handling shared by both
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────┐
//!                  │  Dispatcher  │  every interval
//!                  └──────┬───────┘
//!                         │ launch N
//!         ┌───────────────┼───────────────┐
//!         ▼               ▼               ▼
//!    ┌─────────┐     ┌─────────┐     ┌─────────┐
//!    │ Worker 1│     │ Worker 2│     │ Worker N│
//!    └────┬────┘     └────┬────┘     └────┬────┘
//!         └───────────────┼───────────────┘
//!                  ┌──────▼───────┐
//!                  │ Queue table  │
//!                  └──────────────┘
//! ```
//!
//! Workers never talk to the dispatcher. A worker that dies leaves its rows
//! `processing`; the next cycle past the stale threshold returns them to
//! `pending`.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_dispatch::scheduler::{shutdown, Dispatcher, DispatcherConfig};
//!
//! let dispatcher = Dispatcher::new(store, launcher, DispatcherConfig::new("prod"));
//! let report = dispatcher.run_cycle().await?;
//! println!("launched {} workers", report.workers_launched);
//! ```

pub mod dispatcher;
pub mod processor;
pub mod shutdown;
pub mod worker;

pub use dispatcher::{
    compute_workers_needed, new_owner_id, DispatchDecision, DispatchError, DispatchReport,
    Dispatcher, DispatcherConfig,
};
pub use processor::{EntryProcessor, HttpProcessor, ProcessRequest};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use worker::{BatchSummary, Worker, WorkerConfig, WorkerError, WorkerOutcome};
