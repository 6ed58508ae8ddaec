//! PostgreSQL queue store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE … RETURNING`,
//! so concurrent workers lock disjoint row sets instead of waiting on each
//! other.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, info, warn};

use super::entry::{ClaimedEntry, EntryRow, QueueEntry, StatusCounts};
use super::migrations::MigrationRunner;
use super::schema::Statements;
use super::store::{stale_cutoff, QueueConfig, QueueError, QueueStore};
use crate::provision::Credentials;

/// PostgreSQL-backed [`QueueStore`].
pub struct PgQueueStore {
    pool: PgPool,
    config: QueueConfig,
    sql: Statements,
}

impl PgQueueStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - PostgreSQL connection string
    /// * `config` - Queue table settings
    /// * `credentials` - Optional username/password overriding the URL's
    pub async fn connect(
        database_url: &str,
        config: QueueConfig,
        credentials: Option<&Credentials>,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let mut options = PgConnectOptions::from_str(database_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        if let Some(credentials) = credentials {
            options = options
                .username(&credentials.username)
                .password(&credentials.password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_pool(pool, config))
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: PgPool, config: QueueConfig) -> Self {
        let sql = Statements::postgres(&config.table);
        Self { pool, config, sql }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn migrate(&self) -> Result<usize, QueueError> {
        let runner = MigrationRunner::Postgres(self.pool.clone());
        Ok(runner.run_migrations(&self.config.table).await?)
    }

    async fn claim_batch(
        &self,
        owner: &str,
        batch_size: usize,
    ) -> Result<Vec<ClaimedEntry>, QueueError> {
        let mut claimed: Vec<ClaimedEntry> = sqlx::query_as(&self.sql.claim)
            .bind(owner)
            .bind(Utc::now())
            .bind(self.config.retry_ceiling)
            .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        debug!(owner = %owner, claimed = claimed.len(), "Claimed entries");
        Ok(claimed)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<u64, QueueError> {
        let Some(cutoff) = stale_cutoff(Utc::now(), threshold) else {
            warn!(?threshold, "Stale threshold predates the earliest timestamp");
            return Ok(0);
        };

        let reclaimed = sqlx::query(&self.sql.reclaim_stale)
            .bind(cutoff)
            .bind(self.config.retry_ceiling)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if reclaimed > 0 {
            info!(reclaimed, "Reset stale entries");
        }
        Ok(reclaimed)
    }

    async fn count_claimable(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(&self.sql.count_claimable)
            .bind(self.config.retry_ceiling)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn mark_completed(&self, id: i64, owner: &str) -> Result<bool, QueueError> {
        let updated = sqlx::query(&self.sql.mark_completed)
            .bind(Utc::now())
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn mark_failed(&self, id: i64, owner: &str, error: &str) -> Result<bool, QueueError> {
        let updated = sqlx::query(&self.sql.mark_failed)
            .bind(Utc::now())
            .bind(error)
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    async fn release(&self, ids: &[i64], owner: &str) -> Result<u64, QueueError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let released = sqlx::query(&self.sql.release)
            .bind(owner)
            .bind(ids)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released)
    }

    async fn requeue_failed(&self) -> Result<u64, QueueError> {
        let requeued = sqlx::query(&self.sql.requeue_failed)
            .bind(self.config.retry_ceiling)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if requeued > 0 {
            info!(requeued, "Requeued failed entries");
        }
        Ok(requeued)
    }

    async fn enqueue(&self, payload: &serde_json::Value) -> Result<i64, QueueError> {
        let id: i64 = sqlx::query_scalar(&self.sql.enqueue)
            .bind(serde_json::to_string(payload)?)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn status_counts(&self) -> Result<StatusCounts, QueueError> {
        let counts = sqlx::query_as(&self.sql.status_counts)
            .bind(self.config.retry_ceiling)
            .fetch_one(&self.pool)
            .await?;
        Ok(counts)
    }

    async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError> {
        let row: Option<EntryRow> = sqlx::query_as(&self.sql.get)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(QueueEntry::try_from).transpose()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
