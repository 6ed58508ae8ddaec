//! Queue entry types.
//!
//! A [`QueueEntry`] is one row of the queue table. Payloads stay opaque JSON
//! text at this layer; they are only parsed when a worker builds the
//! external request.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::QueueError;

/// Maximum stored length of `error_message`, in characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Lifecycle status of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Processed successfully.
    Completed,
    /// Processing failed.
    Failed,
}

impl EntryStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [EntryStatus; 4] = [
        EntryStatus::Pending,
        EntryStatus::Processing,
        EntryStatus::Completed,
        EntryStatus::Failed,
    ];

    /// The value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true if no worker will touch the entry again without a requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidRow(format!("unknown status '{other}'"))),
        }
    }
}

/// A full row of the queue table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: i64,
    /// Raw JSON text.
    pub payload: String,
    pub status: EntryStatus,
    pub owner: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Row shape shared by the PostgreSQL and SQLite backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub payload: String,
    pub status: String,
    pub owner: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TryFrom<EntryRow> for QueueEntry {
    type Error = QueueError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            payload: row.payload,
            status: row.status.parse()?,
            owner: row.owner,
            retry_count: row.retry_count,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            error_message: row.error_message,
        })
    }
}

/// An entry returned by a successful claim.
///
/// Owned exclusively by the claiming worker until it writes a terminal
/// status or the claim goes stale.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ClaimedEntry {
    pub id: i64,
    /// Raw JSON text.
    pub payload: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
}

impl ClaimedEntry {
    /// Parses the payload as JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Aggregate row counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    /// Pending rows at or above the retry ceiling; never claimed again.
    pub exhausted: i64,
}

impl StatusCounts {
    /// Total number of rows in the table.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Count for a single status.
    pub fn get(&self, status: EntryStatus) -> i64 {
        match status {
            EntryStatus::Pending => self.pending,
            EntryStatus::Processing => self.processing,
            EntryStatus::Completed => self.completed,
            EntryStatus::Failed => self.failed,
        }
    }
}

/// Truncates an error message to [`MAX_ERROR_MESSAGE_LEN`] characters.
pub fn truncate_error_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
