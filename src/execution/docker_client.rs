//! Docker worker launcher using the bollard crate.
//!
//! Each launch creates and starts one auto-removed container from the worker
//! image, running the `work` subcommand with the per-launch overrides.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use tracing::{debug, warn};

use super::launcher::{worker_env, LaunchRequest, LaunchedWorker, WorkerLauncher};
use super::LauncherConfig;
use crate::error::LaunchError;

/// Launches workers as Docker containers.
pub struct DockerLauncher {
    docker: Docker,
    config: LauncherConfig,
}

impl DockerLauncher {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError::DaemonUnavailable` if the daemon is not accessible.
    pub fn new(config: LauncherConfig) -> Result<Self, LaunchError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| LaunchError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker, config })
    }

    /// Creates a launcher from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker, config: LauncherConfig) -> Self {
        Self { docker, config }
    }

    /// Force-removes a container that was created but never started.
    async fn discard_container(&self, id: &str) {
        match self.docker.remove_container(id, Some(discard_options())).await {
            Ok(()) => debug!(container = %id, "Removed unstarted worker container"),
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to remove unstarted worker container")
            }
        }
    }

    fn container_config(&self, request: &LaunchRequest) -> Config<String> {
        let env = worker_env(&self.config.inherited_env, request)
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let host_config = HostConfig {
            auto_remove: Some(true),
            network_mode: self.config.network.clone(),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["work".to_string()]),
            env: Some(env),
            labels: Some(
                [("queue-dispatch.owner".to_string(), request.owner_id.clone())]
                    .into_iter()
                    .collect(),
            ),
            host_config: Some(host_config),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        }
    }
}

fn discard_options() -> RemoveContainerOptions {
    RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    }
}

/// Container name for a worker owner id.
pub fn container_name(owner_id: &str) -> String {
    format!("queue-worker-{owner_id}")
}

#[async_trait]
impl WorkerLauncher for DockerLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedWorker, LaunchError> {
        let options = CreateContainerOptions {
            name: container_name(&request.owner_id),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), self.container_config(request))
            .await
            .map_err(|e| LaunchError::CreateFailed(e.to_string()))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            // auto_remove only applies to containers that started.
            self.discard_container(&response.id).await;
            return Err(LaunchError::StartFailed {
                id: response.id,
                reason: e.to_string(),
            });
        }

        debug!(container = %response.id, owner = %request.owner_id, "Started worker container");
        Ok(LaunchedWorker {
            handle: response.id,
            owner: request.owner_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::launcher::OWNER_ID_ENV;

    #[test]
    fn test_container_name() {
        assert_eq!(
            container_name("prod-20240301120000-0badf00d"),
            "queue-worker-prod-20240301120000-0badf00d"
        );
    }

    #[test]
    fn test_container_config_carries_overrides() {
        // connect_with_local_defaults does not contact the daemon.
        let Ok(launcher) = DockerLauncher::new(
            LauncherConfig::default()
                .with_image("registry.internal/queue-dispatch:1.2")
                .with_network("workers"),
        ) else {
            return;
        };

        let config = launcher.container_config(&LaunchRequest::new("dev-1", 4));
        assert_eq!(config.image.as_deref(), Some("registry.internal/queue-dispatch:1.2"));
        assert_eq!(config.cmd, Some(vec!["work".to_string()]));

        let env = config.env.unwrap();
        assert!(env.contains(&format!("{OWNER_ID_ENV}=dev-1")));
        assert!(env.contains(&"QUEUE_BATCH_SIZE=4".to_string()));

        let host = config.host_config.unwrap();
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("workers"));
    }

    #[test]
    fn test_discard_options_force_remove() {
        let options = discard_options();
        assert!(options.force);
        assert!(options.v);
    }

    // Needs a Docker daemon with the alpine image pulled.
    #[tokio::test]
    #[ignore] // Run with: cargo test test_failed_start_leaves_no_container -- --ignored
    async fn test_failed_start_leaves_no_container() {
        let launcher = DockerLauncher::new(
            LauncherConfig::default()
                .with_image("alpine:3")
                .with_network("queue-dispatch-missing-network"),
        )
        .unwrap();

        let request = LaunchRequest::new("it-start-failure", 1);
        let err = launcher.launch(&request).await.unwrap_err();
        assert!(matches!(err, LaunchError::StartFailed { .. }));

        let inspected = launcher
            .docker
            .inspect_container(&container_name(&request.owner_id), None)
            .await;
        assert!(inspected.is_err());
    }
}
