//! The worker-launch seam.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LaunchError;

/// Environment variable carrying the owner id to a launched worker.
pub const OWNER_ID_ENV: &str = "QUEUE_WORKER_OWNER_ID";
/// Environment variable carrying the batch size to a launched worker.
pub const BATCH_SIZE_ENV: &str = "QUEUE_BATCH_SIZE";

/// Parameters for one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Owner id the worker claims under.
    pub owner_id: String,
    /// Maximum rows the worker claims.
    pub batch_size: usize,
}

impl LaunchRequest {
    pub fn new(owner_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            owner_id: owner_id.into(),
            batch_size,
        }
    }

    /// The per-launch overrides, as `KEY=VALUE` pairs.
    pub fn overrides(&self) -> Vec<(String, String)> {
        vec![
            (OWNER_ID_ENV.to_string(), self.owner_id.clone()),
            (BATCH_SIZE_ENV.to_string(), self.batch_size.to_string()),
        ]
    }
}

/// A worker that was successfully started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedWorker {
    /// Launcher-specific handle: container id or process id.
    pub handle: String,
    /// Owner id the worker was started with.
    pub owner: String,
}

/// Starts one worker instance per call.
///
/// A launch only has to start the worker; it never waits for it to finish.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError>;
}

/// Merges inherited variables with a request's overrides.
///
/// Overrides replace inherited entries with the same key.
pub fn worker_env(
    inherited: &[(String, String)],
    request: &LaunchRequest,
) -> Vec<(String, String)> {
    let overrides = request.overrides();
    let mut env: Vec<(String, String)> = inherited
        .iter()
        .filter(|(key, _)| !overrides.iter().any(|(k, _)| k == key))
        .cloned()
        .collect();
    env.extend(overrides);
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_inherited() {
        let inherited = vec![
            ("DATABASE_URL".to_string(), "postgres://db/queue".to_string()),
            (BATCH_SIZE_ENV.to_string(), "99".to_string()),
        ];
        let request = LaunchRequest::new("dev-20240101000000-deadbeef", 8);

        let env = worker_env(&inherited, &request);
        assert_eq!(env.len(), 3);
        assert!(env.contains(&("DATABASE_URL".to_string(), "postgres://db/queue".to_string())));
        assert!(env.contains(&(BATCH_SIZE_ENV.to_string(), "8".to_string())));
        assert!(env.contains(&(
            OWNER_ID_ENV.to_string(),
            "dev-20240101000000-deadbeef".to_string()
        )));
    }
}
