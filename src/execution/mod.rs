//! Worker launching.
//!
//! The dispatcher starts workers through the [`WorkerLauncher`] trait. Two
//! launchers ship with the crate:
//!
//! - [`DockerLauncher`]: one auto-removed container per worker (bollard)
//! - [`ProcessLauncher`]: one child process re-running this binary
//!
//! Both pass the owner id and batch size as environment overrides on top of
//! the dispatcher's own queue settings.
//!
//! # Example
//!
//! ```ignore
//! use queue_dispatch::execution::{build_launcher, LauncherConfig, LaunchRequest};
//!
//! let launcher = build_launcher(&LauncherConfig::default())?;
//! let worker = launcher.launch(&LaunchRequest::new("dev-20240101120000-1a2b3c4d", 8)).await?;
//! ```

pub mod docker_client;
pub mod launcher;
pub mod process;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub use docker_client::DockerLauncher;
pub use launcher::{
    worker_env, LaunchRequest, LaunchedWorker, WorkerLauncher, BATCH_SIZE_ENV, OWNER_ID_ENV,
};
pub use process::ProcessLauncher;

use crate::error::LaunchError;

/// Which launcher the dispatcher uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LauncherKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for LauncherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            other => Err(format!("unknown launcher '{other}' (expected docker or process)")),
        }
    }
}

impl fmt::Display for LauncherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Settings shared by the launchers.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub kind: LauncherKind,
    /// Container image (Docker only).
    pub image: String,
    /// Container network (Docker only).
    pub network: Option<String>,
    /// Worker binary (process only); defaults to the current executable.
    pub program: Option<PathBuf>,
    /// Variables every worker inherits before per-launch overrides.
    pub inherited_env: Vec<(String, String)>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            kind: LauncherKind::Docker,
            image: "queue-dispatch:latest".to_string(),
            network: None,
            program: None,
            inherited_env: Vec::new(),
        }
    }
}

impl LauncherConfig {
    pub fn new(kind: LauncherKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_inherited_env(mut self, env: Vec<(String, String)>) -> Self {
        self.inherited_env = env;
        self
    }

    /// Picks the variables a worker needs from the current process.
    ///
    /// Forwards `DATABASE_URL`, `RUST_LOG` and every `QUEUE_*` variable.
    pub fn forwarded_env() -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(key, _)| is_forwarded(key))
            .collect()
    }
}

fn is_forwarded(key: &str) -> bool {
    key == "DATABASE_URL" || key == "RUST_LOG" || key.starts_with("QUEUE_")
}

/// Builds the launcher selected by `config.kind`.
pub fn build_launcher(config: &LauncherConfig) -> Result<Arc<dyn WorkerLauncher>, LaunchError> {
    match config.kind {
        LauncherKind::Docker => Ok(Arc::new(DockerLauncher::new(config.clone())?)),
        LauncherKind::Process => Ok(Arc::new(ProcessLauncher::new(config.clone())?)),
    }
}
