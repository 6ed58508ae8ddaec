//! Local process launcher.
//!
//! Re-executes the worker binary with the `work` subcommand. Useful on a
//! single host and in development where no Docker daemon is around.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::launcher::{worker_env, LaunchRequest, LaunchedWorker, WorkerLauncher};
use super::LauncherConfig;
use crate::error::LaunchError;

/// Launches workers as detached child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    config: LauncherConfig,
}

impl ProcessLauncher {
    /// Launches `config.program`, or the current executable when unset.
    pub fn new(config: LauncherConfig) -> Result<Self, LaunchError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self { program, config })
    }

    /// The binary this launcher runs.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError> {
        let child = Command::new(&self.program)
            .arg("work")
            .envs(worker_env(&self.config.inherited_env, request))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| LaunchError::SpawnFailed(format!("{}: {e}", self.program.display())))?;

        let pid = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "exited".to_string());

        debug!(pid = %pid, owner = %request.owner_id, "Spawned worker process");
        Ok(LaunchedWorker {
            handle: pid,
            owner: request.owner_id.clone(),
        })
    }
}
