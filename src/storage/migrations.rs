//! Database migration helpers.
//!
//! This module applies the queue table schema and records each applied
//! statement in a `_migrations` table so reruns are no-ops.

use sqlx::{PgPool, SqlitePool};
use thiserror::Error;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub enum MigrationRunner {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl MigrationRunner {
    /// Runs all pending migrations for `table`.
    ///
    /// This method is idempotent: migrations are tracked by name and every
    /// statement uses IF NOT EXISTS.
    pub async fn run_migrations(&self, table: &str) -> Result<usize, MigrationError> {
        self.ensure_migrations_table().await?;

        let statements = match self {
            Self::Postgres(_) => schema::postgres_schema(table),
            Self::Sqlite(_) => schema::sqlite_schema(table),
        };

        let mut applied = 0;
        for (idx, statement) in statements.iter().enumerate() {
            let migration_name = format!("{}_v1_part_{}", table, idx);

            if !self.is_migration_applied(&migration_name).await? {
                self.apply_migration(&migration_name, statement).await?;
                applied += 1;
            }
        }

        Ok(applied)
    }

    /// Ensures the migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS _migrations (
                        id SERIAL PRIMARY KEY,
                        name VARCHAR(255) NOT NULL UNIQUE,
                        applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    )
                    "#,
                )
                .execute(pool)
                .await?;
            }
            Self::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS _migrations (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        name TEXT NOT NULL UNIQUE,
                        applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                    )
                    "#,
                )
                .execute(pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Checks if a migration has already been applied.
    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let result: Option<(i64,)> = match self {
            Self::Postgres(pool) => {
                sqlx::query_as("SELECT id::BIGINT FROM _migrations WHERE name = $1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await?
            }
            Self::Sqlite(pool) => {
                sqlx::query_as("SELECT id FROM _migrations WHERE name = ?1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await?
            }
        };

        Ok(result.is_some())
    }

    /// Applies a single migration inside a transaction.
    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        match self {
            Self::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;
                sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
            Self::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                sqlx::query(sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;
                sqlx::query("INSERT INTO _migrations (name) VALUES (?1)")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
            }
        }

        tracing::debug!(migration = %name, "Applied migration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should open")
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("test error".to_string());
        assert!(err.to_string().contains("test error"));
    }

    #[tokio::test]
    async fn test_sqlite_migrations_are_idempotent() {
        let pool = memory_pool().await;
        let runner = MigrationRunner::Sqlite(pool.clone());

        let first = runner.run_migrations("queue_entries").await.unwrap();
        assert_eq!(first, 3);

        let second = runner.run_migrations("queue_entries").await.unwrap();
        assert_eq!(second, 0);

        let applied: Vec<String> = sqlx::query_scalar("SELECT name FROM _migrations ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[0], "queue_entries_v1_part_0");
    }
}
