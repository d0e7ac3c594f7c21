use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

/// Container-lifecycle manager backed by the `docker` CLI. Each call is one
/// blocking external request; the daemon provides its own consistency, so no
/// locking happens here.
#[derive(Debug, Clone)]
pub struct ContainerManager {
    docker_bin: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunContainerOptions {
    pub name: String,
    pub network: String,
    pub command: Vec<String>,
}

impl Default for RunContainerOptions {
    fn default() -> Self {
        Self {
            name: "workspace".to_string(),
            network: "host".to_string(),
            command: Vec::new(),
        }
    }
}

/// One row of `docker ps` in its JSON output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "CreatedAt", default)]
    pub created_at: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
}

impl Default for ContainerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerManager {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    /// Mainly for tests: run a different binary in place of `docker`.
    pub fn with_binary(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }

    /// Start a detached container from an image; returns the container id.
    pub async fn run_container(
        &self,
        image_tag: &str,
        options: &RunContainerOptions,
    ) -> Result<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            options.name.clone(),
            "--network".to_string(),
            options.network.clone(),
            image_tag.to_string(),
        ];
        args.extend(options.command.iter().cloned());

        let container_id = self.docker(&args).await?;
        info!(%container_id, image_tag, "container started");
        Ok(container_id)
    }

    /// Restart an existing (stopped) container by id.
    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        self.docker(&["start".to_string(), container_id.to_string()])
            .await?;
        info!(%container_id, "container started");
        Ok(())
    }

    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.docker(&["stop".to_string(), container_id.to_string()])
            .await?;
        info!(%container_id, "container stopped");
        Ok(())
    }

    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.docker(&["rm".to_string(), container_id.to_string()])
            .await?;
        info!(%container_id, "container removed");
        Ok(())
    }

    /// Copy a path out of the container to the host. The destination's
    /// parent directory is created first.
    pub async fn copy_from_container(
        &self,
        container_id: &str,
        source_path: &str,
        destination: &Path,
    ) -> Result<()> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create copy destination: {}", parent.display())
            })?;
        }

        self.docker(&[
            "cp".to_string(),
            format!("{container_id}:{source_path}"),
            destination.to_string_lossy().into_owned(),
        ])
        .await?;
        info!(%container_id, source_path, destination = %destination.display(), "copied container data");
        Ok(())
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let output = self
            .docker(&[
                "ps".to_string(),
                "-a".to_string(),
                "--format".to_string(),
                "{{json .}}".to_string(),
            ])
            .await?;
        parse_container_lines(&output)
    }

    async fn docker(&self, args: &[String]) -> Result<String> {
        debug!(target: "docker_cli", command = %args.join(" "), "invoking docker");

        let output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .context("failed to execute docker — is it installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "docker {} exited with status {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn parse_container_lines(output: &str) -> Result<Vec<ContainerSummary>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("failed to parse docker ps output line: {line}"))
        })
        .collect()
}
