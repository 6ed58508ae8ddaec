//! queue-dispatch: lease-based work-queue dispatcher and batch workers.
//!
//! A durable SQL table holds work entries. A periodic dispatcher reclaims
//! abandoned leases and launches enough short-lived workers to drain the
//! backlog; each worker atomically claims a batch, calls an external endpoint
//! for every row over mutual TLS, and records `completed` or `failed`.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod metrics;
pub mod provision;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use config::{ConfigError, Settings};
pub use error::{LaunchError, ProcessError, ProvisionError};
pub use scheduler::{DispatchError, WorkerError};
pub use storage::QueueError;
