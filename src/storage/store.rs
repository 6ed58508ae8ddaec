//! The queue-store interface.
//!
//! [`QueueStore`] is the only way the dispatcher and workers touch the queue
//! table. Every method maps to one atomic statement, so concurrent workers
//! can never observe or produce a half-applied transition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::entry::{ClaimedEntry, QueueEntry, StatusCounts};
use super::migrations::MigrationError;
use super::postgres::PgQueueStore;
use super::sqlite::SqliteQueueStore;
use crate::provision::Credentials;

/// Errors that can occur during queue-store operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connection to the queue store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row held a value the queue does not understand.
    #[error("Invalid row: {0}")]
    InvalidRow(String),

    /// The connection URL names an unsupported backend.
    #[error("Unsupported queue store URL: {0}")]
    UnsupportedUrl(String),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// The configured table name is not a plain SQL identifier.
    #[error("Invalid queue table name: '{0}'")]
    InvalidTableName(String),
}

/// Settings shared by every queue-store backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue table name. Must pass [`super::schema::is_valid_table_name`].
    pub table: String,
    /// Rows with `retry_count` at or above this value are never claimed.
    pub retry_ceiling: i32,
    /// Upper bound on waiting for a pooled connection.
    pub acquire_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            table: "queue_entries".to_string(),
            retry_ceiling: 3,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration for `table` with default limits.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    /// Sets the retry ceiling.
    pub fn with_retry_ceiling(mut self, ceiling: i32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    /// Sets the connection acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Rejects table names that cannot be interpolated into SQL.
    pub fn validate(&self) -> Result<(), QueueError> {
        if !super::schema::is_valid_table_name(&self.table) {
            return Err(QueueError::InvalidTableName(self.table.clone()));
        }
        Ok(())
    }
}

/// Oldest `claimed_at` a lease may have before it counts as stale.
///
/// Returns `None` when `threshold` reaches past the representable range, in
/// which case no lease is stale.
pub fn stale_cutoff(now: DateTime<Utc>, threshold: Duration) -> Option<DateTime<Utc>> {
    let threshold = chrono::Duration::from_std(threshold).ok()?;
    now.checked_sub_signed(threshold)
}

/// Durable queue table access.
///
/// Terminal writes are fenced on the claimant: they only apply while the row
/// is still `processing` and owned by `owner`. A write that lost its lease to
/// a stale reclaim returns `false` and changes nothing.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Creates the queue table and indexes if they do not exist.
    async fn migrate(&self) -> Result<usize, QueueError>;

    /// Atomically claims up to `batch_size` claimable rows, oldest first.
    async fn claim_batch(
        &self,
        owner: &str,
        batch_size: usize,
    ) -> Result<Vec<ClaimedEntry>, QueueError>;

    /// Resets `processing` rows claimed more than `threshold` ago back to
    /// `pending`, incrementing `retry_count`. Rows at the retry ceiling are
    /// left untouched.
    async fn reclaim_stale(&self, threshold: Duration) -> Result<u64, QueueError>;

    /// Counts `pending` rows below the retry ceiling.
    async fn count_claimable(&self) -> Result<u64, QueueError>;

    /// Marks a claimed row `completed`. Returns false if the lease was lost.
    async fn mark_completed(&self, id: i64, owner: &str) -> Result<bool, QueueError>;

    /// Marks a claimed row `failed`. Returns false if the lease was lost.
    async fn mark_failed(&self, id: i64, owner: &str, error: &str) -> Result<bool, QueueError>;

    /// Returns claimed-but-unstarted rows to `pending` without counting a retry.
    async fn release(&self, ids: &[i64], owner: &str) -> Result<u64, QueueError>;

    /// Moves `failed` rows that would stay below the ceiling back to `pending`.
    async fn requeue_failed(&self) -> Result<u64, QueueError>;

    /// Inserts a new `pending` row and returns its id.
    async fn enqueue(&self, payload: &serde_json::Value) -> Result<i64, QueueError>;

    /// Aggregate counts per status.
    async fn status_counts(&self) -> Result<StatusCounts, QueueError>;

    /// Fetches a single row.
    async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError>;

    /// Closes the underlying connection pool.
    async fn close(&self);
}

/// Connects to the queue store named by `url`.
///
/// `postgres://` and `postgresql://` URLs use [`PgQueueStore`]; `sqlite:` URLs
/// use [`SqliteQueueStore`]. Credentials, when given, override the ones in a
/// PostgreSQL URL and are ignored for SQLite.
pub async fn connect(
    url: &str,
    config: QueueConfig,
    credentials: Option<&Credentials>,
) -> Result<Arc<dyn QueueStore>, QueueError> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PgQueueStore::connect(url, config, credentials).await?;
        Ok(Arc::new(store))
    } else if url.starts_with("sqlite:") {
        let store = SqliteQueueStore::connect(url, config).await?;
        Ok(Arc::new(store))
    } else {
        Err(QueueError::UnsupportedUrl(redact_url(url)))
    }
}

/// Strips everything after the scheme so credentials never reach logs.
fn redact_url(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://…"),
        None => url.chars().take(16).collect(),
    }
}
