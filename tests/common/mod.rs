//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use queue_dispatch::error::{LaunchError, ProcessError};
use queue_dispatch::execution::{LaunchRequest, LaunchedWorker, WorkerLauncher};
use queue_dispatch::scheduler::{EntryProcessor, ProcessRequest};
use queue_dispatch::storage::{QueueConfig, QueueStore, SqliteQueueStore};

/// A migrated single-connection in-memory store.
pub async fn memory_store() -> Arc<SqliteQueueStore> {
    let store = SqliteQueueStore::connect("sqlite::memory:", QueueConfig::default())
        .await
        .expect("in-memory sqlite should open");
    store.migrate().await.expect("migrations should apply");
    Arc::new(store)
}

/// Enqueues `count` payloads of the form `{"n": i}`.
pub async fn enqueue_n(store: &SqliteQueueStore, count: usize) -> Vec<i64> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        ids.push(
            store
                .enqueue(&serde_json::json!({ "n": n }))
                .await
                .expect("enqueue should succeed"),
        );
    }
    ids
}

/// Moves `claimed_at` of `ids` back by `age`, as if claimed that long ago.
pub async fn backdate_claims(store: &SqliteQueueStore, ids: &[i64], age: Duration) {
    let claimed_at = Utc::now() - chrono::Duration::from_std(age).unwrap();
    let sql = format!("UPDATE {} SET claimed_at = ?1 WHERE id = ?2", store.table());
    for id in ids {
        sqlx::query(&sql)
            .bind(claimed_at)
            .bind(*id)
            .execute(store.pool())
            .await
            .expect("backdate should succeed");
    }
}

/// Forces `retry_count` for `ids`.
pub async fn set_retry_count(store: &SqliteQueueStore, ids: &[i64], retry_count: i32) {
    let sql = format!("UPDATE {} SET retry_count = ?1 WHERE id = ?2", store.table());
    for id in ids {
        sqlx::query(&sql)
            .bind(retry_count)
            .bind(*id)
            .execute(store.pool())
            .await
            .expect("retry_count update should succeed");
    }
}

/// Launcher that records requests instead of starting anything.
#[derive(Default)]
pub struct RecordingLauncher {
    requests: Mutex<Vec<LaunchRequest>>,
    /// Zero-based launch indexes that fail.
    failing: Vec<usize>,
}

impl RecordingLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(failing: Vec<usize>) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failing,
        }
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerLauncher for RecordingLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len() - 1
        };

        if self.failing.contains(&index) {
            return Err(LaunchError::CreateFailed(format!("launch {index} refused")));
        }

        Ok(LaunchedWorker {
            handle: format!("fake-{index}"),
            owner: request.owner_id.clone(),
        })
    }
}

/// Processor that fails entries whose payload has `"fail": true`.
#[derive(Default)]
pub struct ScriptedProcessor {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `delay` first.
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntryProcessor for ScriptedProcessor {
    async fn process(&self, request: &ProcessRequest) -> Result<serde_json::Value, ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if request.data.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ProcessError::Status(500));
        }
        Ok(serde_json::json!({ "entry_id": request.entry_id, "ok": true }))
    }
}
