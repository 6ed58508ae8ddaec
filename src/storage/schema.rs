//! Queue table schema and SQL statements.
//!
//! The table name is configurable, so every statement is rendered once per
//! store from a validated identifier. Each mutating statement touches only
//! the rows it selects and runs as a single statement; there is no
//! read-then-write across round trips.

/// Maximum identifier length accepted for the queue table.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Returns true if `name` is a plain SQL identifier safe to interpolate.
pub fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_IDENTIFIER_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// DDL for the PostgreSQL backend.
pub fn postgres_schema(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGSERIAL PRIMARY KEY,
    payload JSONB NOT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'pending',
    owner VARCHAR(255),
    retry_count INTEGER DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    claimed_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    failed_at TIMESTAMPTZ,
    error_message VARCHAR(1000),
    CONSTRAINT {table}_status_check
        CHECK (status IN ('pending', 'processing', 'completed', 'failed'))
)
"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (status, created_at, id)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_stale_idx ON {table} (claimed_at) \
             WHERE status = 'processing'"
        ),
    ]
}

/// DDL for the SQLite backend.
pub fn sqlite_schema(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    owner TEXT,
    retry_count INTEGER DEFAULT 0,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    completed_at TEXT,
    failed_at TEXT,
    error_message TEXT
)
"#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx ON {table} (status, created_at, id)"
        ),
        format!("CREATE INDEX IF NOT EXISTS {table}_stale_idx ON {table} (status, claimed_at)"),
    ]
}

/// Rendered statements for one queue table.
#[derive(Debug, Clone)]
pub struct Statements {
    /// Binds: owner, claimed_at, retry ceiling, limit.
    pub claim: String,
    /// Binds: cutoff, retry ceiling.
    pub reclaim_stale: String,
    /// Binds: retry ceiling.
    pub count_claimable: String,
    /// Binds: completed_at, id, owner.
    pub mark_completed: String,
    /// Binds: failed_at, error_message, id, owner.
    pub mark_failed: String,
    /// Binds: owner, ids.
    pub release: String,
    /// Binds: retry ceiling.
    pub requeue_failed: String,
    /// Binds: payload, created_at.
    pub enqueue: String,
    /// Binds: retry ceiling.
    pub status_counts: String,
    /// Binds: id.
    pub get: String,
}

impl Statements {
    /// Statements for PostgreSQL. Claims skip rows locked by a concurrent claim.
    pub fn postgres(table: &str) -> Self {
        Self {
            claim: format!(
                r#"
UPDATE {table}
SET status = 'processing', owner = $1, claimed_at = $2
WHERE id IN (
    SELECT id FROM {table}
    WHERE status = 'pending'
      AND (retry_count < $3 OR retry_count IS NULL)
    ORDER BY created_at ASC, id ASC
    LIMIT $4
    FOR UPDATE SKIP LOCKED
)
RETURNING id, payload::text AS payload, COALESCE(retry_count, 0) AS retry_count,
          created_at, claimed_at
"#
            ),
            reclaim_stale: format!(
                r#"
UPDATE {table}
SET status = 'pending', owner = NULL, claimed_at = NULL,
    retry_count = COALESCE(retry_count, 0) + 1
WHERE status = 'processing'
  AND claimed_at < $1
  AND (retry_count < $2 OR retry_count IS NULL)
"#
            ),
            count_claimable: format!(
                "SELECT COUNT(*) FROM {table} \
                 WHERE status = 'pending' AND (retry_count < $1 OR retry_count IS NULL)"
            ),
            mark_completed: format!(
                r#"
UPDATE {table}
SET status = 'completed', completed_at = $1, owner = NULL, claimed_at = NULL,
    error_message = NULL
WHERE id = $2 AND owner = $3 AND status = 'processing'
"#
            ),
            mark_failed: format!(
                r#"
UPDATE {table}
SET status = 'failed', failed_at = $1, error_message = $2, owner = NULL, claimed_at = NULL
WHERE id = $3 AND owner = $4 AND status = 'processing'
"#
            ),
            release: format!(
                "UPDATE {table} SET status = 'pending', owner = NULL, claimed_at = NULL \
                 WHERE owner = $1 AND status = 'processing' AND id = ANY($2)"
            ),
            requeue_failed: format!(
                r#"
UPDATE {table}
SET status = 'pending', failed_at = NULL, error_message = NULL,
    retry_count = COALESCE(retry_count, 0) + 1
WHERE status = 'failed'
  AND COALESCE(retry_count, 0) + 1 < $1
"#
            ),
            enqueue: format!(
                "INSERT INTO {table} (payload, status, retry_count, created_at) \
                 VALUES ($1::jsonb, 'pending', 0, $2) RETURNING id"
            ),
            status_counts: status_counts_sql(table, "$1"),
            get: format!(
                r#"
SELECT id, payload::text AS payload, status, owner, COALESCE(retry_count, 0) AS retry_count,
       created_at, claimed_at, completed_at, failed_at, error_message
FROM {table}
WHERE id = $1
"#
            ),
        }
    }

    /// Statements for SQLite. The database write lock serializes claims.
    pub fn sqlite(table: &str) -> Self {
        Self {
            claim: format!(
                r#"
UPDATE {table}
SET status = 'processing', owner = ?1, claimed_at = ?2
WHERE id IN (
    SELECT id FROM {table}
    WHERE status = 'pending'
      AND (retry_count < ?3 OR retry_count IS NULL)
    ORDER BY created_at ASC, id ASC
    LIMIT ?4
)
RETURNING id, payload, COALESCE(retry_count, 0) AS retry_count, created_at, claimed_at
"#
            ),
            reclaim_stale: format!(
                r#"
UPDATE {table}
SET status = 'pending', owner = NULL, claimed_at = NULL,
    retry_count = COALESCE(retry_count, 0) + 1
WHERE status = 'processing'
  AND claimed_at < ?1
  AND (retry_count < ?2 OR retry_count IS NULL)
"#
            ),
            count_claimable: format!(
                "SELECT COUNT(*) FROM {table} \
                 WHERE status = 'pending' AND (retry_count < ?1 OR retry_count IS NULL)"
            ),
            mark_completed: format!(
                r#"
UPDATE {table}
SET status = 'completed', completed_at = ?1, owner = NULL, claimed_at = NULL,
    error_message = NULL
WHERE id = ?2 AND owner = ?3 AND status = 'processing'
"#
            ),
            mark_failed: format!(
                r#"
UPDATE {table}
SET status = 'failed', failed_at = ?1, error_message = ?2, owner = NULL, claimed_at = NULL
WHERE id = ?3 AND owner = ?4 AND status = 'processing'
"#
            ),
            // ids are bound as one JSON array.
            release: format!(
                "UPDATE {table} SET status = 'pending', owner = NULL, claimed_at = NULL \
                 WHERE owner = ?1 AND status = 'processing' \
                 AND id IN (SELECT value FROM json_each(?2))"
            ),
            requeue_failed: format!(
                r#"
UPDATE {table}
SET status = 'pending', failed_at = NULL, error_message = NULL,
    retry_count = COALESCE(retry_count, 0) + 1
WHERE status = 'failed'
  AND COALESCE(retry_count, 0) + 1 < ?1
"#
            ),
            enqueue: format!(
                "INSERT INTO {table} (payload, status, retry_count, created_at) \
                 VALUES (?1, 'pending', 0, ?2) RETURNING id"
            ),
            status_counts: status_counts_sql(table, "?1"),
            get: format!(
                r#"
SELECT id, payload, status, owner, COALESCE(retry_count, 0) AS retry_count,
       created_at, claimed_at, completed_at, failed_at, error_message
FROM {table}
WHERE id = ?1
"#
            ),
        }
    }
}

fn status_counts_sql(table: &str, ceiling: &str) -> String {
    format!(
        r#"
SELECT
    COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
    COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
    COALESCE(SUM(CASE WHEN status = 'pending' AND retry_count >= {ceiling} THEN 1 ELSE 0 END), 0)
        AS exhausted
FROM {table}
"#
    )
}
