//! Docker client for running toolchain containers.

use std::{collections::HashSet, mem, path::Path, time::Duration};

use anyhow::{Context, Result};
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    secret::HostConfig,
};
use derive_more::Deref;
use futures::{StreamExt, executor::block_on, future::join_all};
use tokio::{task::JoinHandle, time::timeout};

/// Timeout for shutting down docker and cleaning up containers.
const DOCKER_DROP_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of trailing log lines included in the error of a failed container.
const FAILURE_LOG_LINES: usize = 20;

/// Configuration for running a one-shot container.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// The Docker image to use.
    pub image: DockerImage,
    /// The entrypoint for the container.
    pub entrypoint: Option<Vec<String>>,
    /// The command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Volume binds (host:container:mode format).
    pub binds: Vec<String>,
    /// `uid:gid` to run as, so files written to binds belong to the caller.
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ServiceConfig {
    /// Create a new service config with the given image.
    pub fn new(image: DockerImage) -> Self {
        Self {
            image,
            entrypoint: None,
            cmd: None,
            binds: Vec::new(),
            user: None,
            working_dir: None,
        }
    }

    /// Set the entrypoint.
    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    /// Set the command.
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Add a volume bind.
    pub fn bind(mut self, host_path: &Path, container_path: &str, mode: &str) -> Self {
        self.binds.push(format!(
            "{}:{}:{}",
            host_path.display(),
            container_path,
            mode
        ));
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    fn container_config(self) -> Config<String> {
        let host_config = HostConfig {
            binds: (!self.binds.is_empty()).then_some(self.binds),
            ..Default::default()
        };

        Config {
            image: Some(self.image.full_name()),
            entrypoint: self.entrypoint,
            cmd: self.cmd,
            user: self.user,
            working_dir: self.working_dir,
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// A Docker image reference with image name and tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct DockerImage {
    /// The image name (e.g., "ethereum/solc").
    pub image: String,
    /// The image tag (e.g., "0.8.24-alpine").
    pub tag: String,
}

impl DockerImage {
    /// Create a new DockerImage with the given image name and tag.
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    /// Pull the image, ensuring it is available locally.
    pub async fn pull(&self, docker: &SilensDocker) -> Result<&Self> {
        docker.pull_image(&self.image, &self.tag).await?;
        Ok(self)
    }

    /// Get the full image reference (image:tag).
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

impl std::fmt::Display for DockerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

/// Configuration for the Docker client.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SilensDockerConfig {
    /// Whether to skip cleanup of containers on exit.
    pub no_cleanup: bool,
}

/// Docker client wrapper for toolchain containers.
#[derive(Deref)]
pub struct SilensDocker {
    #[deref]
    docker: Docker,

    /// Containers that have been started.
    pub containers: HashSet<String>,

    pub config: SilensDockerConfig,
}

impl Drop for SilensDocker {
    fn drop(&mut self) {
        if self.config.no_cleanup {
            tracing::debug!("Cleanup of docker containers on exit is disabled. Exiting.");
            return;
        }

        if self.containers.is_empty() {
            tracing::trace!("No containers to cleanup. Exiting.");
            return;
        }

        tracing::debug!("Cleaning up {} container(s)...", self.containers.len());

        let docker = self.docker.clone();
        let containers = mem::take(&mut self.containers);

        let cleanup = async {
            let results = containers
                .into_iter()
                .map(async |container_id| {
                    Self::stop_and_remove_container_static(&docker, &container_id).await
                })
                .collect::<Vec<_>>();

            timeout(DOCKER_DROP_TIMEOUT, join_all(results))
                .await?
                .into_iter()
                .collect::<Result<Vec<_>>>()?;

            Ok::<_, anyhow::Error>(())
        };

        if let Err(e) = block_on(cleanup) {
            tracing::error!(error = ?e, "Failed to cleanup containers");
            return;
        }

        tracing::debug!("Container cleanup completed");
    }
}

impl SilensDocker {
    const STOP_CONTAINER_TIMEOUT: Duration = Duration::from_secs(5);

    /// Create a new Docker client.
    pub async fn new(config: SilensDockerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is Docker running?")?;

        docker
            .ping()
            .await
            .context("Docker daemon is not responding. Is Docker running?")?;

        Ok(Self {
            docker,
            config,
            containers: HashSet::new(),
        })
    }

    pub async fn pull_image(&self, image: &str, tag: &str) -> Result<()> {
        let full_image = format!("{}:{}", image, tag);

        if self.docker.inspect_image(&full_image).await.is_ok() {
            tracing::debug!(image = %full_image, "Image already available locally, skipping pull");
            return Ok(());
        }

        tracing::info!(image = %full_image, "Pulling image...");

        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                tag: tag.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            let info = result
                .map_err(|e| anyhow::anyhow!("Failed to pull image '{}:{}': {}", image, tag, e))?;
            if let Some(status) = info.status {
                tracing::trace!(status, "Image pull");
            }
        }

        Ok(())
    }

    /// Wait for a container to complete and return its exit code.
    pub async fn wait_for_container(&self, container_id: &str) -> Result<i64> {
        tracing::trace!(container_id, "Waiting for container to complete");

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));

        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => response.status_code,
            // A non-zero exit surfaces as an error carrying the status code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed to wait for container"),
            None => anyhow::bail!("Container wait stream ended without response"),
        };

        tracing::debug!(container_id, exit_code, "Container completed");

        Ok(exit_code)
    }

    /// Stream logs from a container.
    pub async fn stream_logs(&self, container_id: &str) -> Result<JoinHandle<()>> {
        let logs_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        };

        let mut log_stream = self.logs(container_id, Some(logs_options));
        let container_id = container_id.to_string();

        let logs_handle = tokio::spawn(async move {
            while let Some(log_result) = log_stream.next().await {
                match log_result {
                    Ok(log) => {
                        tracing::debug!(?container_id, log = %log.to_string().trim_end());
                    }
                    Err(e) => {
                        tracing::error!("Error streaming logs: {}", e);
                        break;
                    }
                }
            }

            tracing::trace!(container_id, "Logs stream ended");
        });

        Ok(logs_handle)
    }

    /// Last `lines` lines written by a container.
    pub async fn tail_logs(&self, container_id: &str, lines: usize) -> Result<String> {
        let logs_options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            ..Default::default()
        };

        let output = self
            .logs(container_id, Some(logs_options))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<LogOutput>, _>>()
            .context("Failed to read container logs")?;

        Ok(output.iter().map(ToString::to_string).collect())
    }

    /// Run a container until it exits.
    ///
    /// Any stale container with the same name is removed first. Fails when the container
    /// exits with a non-zero code, with the tail of its logs in the error.
    pub async fn run_to_completion(
        &mut self,
        container_name: &str,
        config: ServiceConfig,
    ) -> Result<()> {
        self.stop_and_remove_container(container_name).await?;
        config.image.pull(self).await?;

        let container_config = config.container_config();

        tracing::trace!(container_name, "Creating container");
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name,
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .context("Failed to create container")?;

        let container_id = container.id;
        self.containers.insert(container_id.clone());

        tracing::trace!(container_id, container_name, "Starting container");
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start container")?;

        let (logs_result, wait_result) = tokio::join!(
            self.stream_logs(&container_id),
            self.wait_for_container(&container_id)
        );

        if let Err(e) = logs_result {
            tracing::warn!("Error streaming logs: {}", e);
        }

        let exit_code = wait_result?;
        if exit_code != 0 {
            let logs = self
                .tail_logs(&container_id, FAILURE_LOG_LINES)
                .await
                .unwrap_or_default();
            anyhow::bail!(
                "Container {} exited with non-zero code {}:\n{}",
                container_name,
                exit_code,
                logs.trim_end()
            );
        }

        Ok(())
    }

    async fn stop_and_remove_container_static(docker: &Docker, container_id: &str) -> Result<()> {
        tracing::trace!(container_id, "Stopping and removing container");

        docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: Self::STOP_CONTAINER_TIMEOUT.as_secs() as i64,
                }),
            )
            .await
            .ok(); // Ignore errors if already stopped

        docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .ok(); // Ignore errors if already removed

        tracing::trace!(container_id, "Container stopped and removed");
        Ok(())
    }

    /// Stop and remove a container.
    pub async fn stop_and_remove_container(&mut self, container_id: &str) -> Result<()> {
        self.containers.remove(container_id);
        Self::stop_and_remove_container_static(&self.docker, container_id).await
    }
}
