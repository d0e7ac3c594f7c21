use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::docker::{ContainerManager, RunContainerOptions};
use crate::player::{PlaybackRequest, PlaybackSupervisor};

const CONTAINER_NAME: &str = "workspace";
const CONTAINER_NETWORK: &str = "host";
const BOOTSTRAP_COMMAND: [&str; 3] = [
    "/bin/bash",
    "-c",
    "source scripts/launch/launch_all_sim.bash && tail -f /dev/null",
];

/// Evaluation output locations inside the workload container.
const LIDAR_EVALUATION_DIR: &str = "/home/vscode/workspace/src/lidar/evaluation/";
const ESTIMATION_EVALUATION_DIR: &str = "/home/vscode/workspace/src/estimation/evaluation/";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BagRunOutcome {
    pub bag_path: PathBuf,
    pub outcome: String,
    pub sequence: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenLoopReport {
    pub success: bool,
    pub message: String,
    pub run_id: String,
    pub container_id: Option<String>,
    pub results: Vec<BagRunOutcome>,
    pub output_paths: Vec<PathBuf>,
    pub error: Option<String>,
}

/// Replays a sequence of bags against one workload container, restarting the
/// container between bags, then extracts the evaluation output.
pub struct OpenLoopRunner {
    supervisor: Arc<PlaybackSupervisor>,
    containers: ContainerManager,
    attach_delay: Duration,
    completion_poll_interval: Duration,
    output_dir: PathBuf,
}

impl OpenLoopRunner {
    pub fn new(
        supervisor: Arc<PlaybackSupervisor>,
        containers: ContainerManager,
        attach_delay: Duration,
        completion_poll_interval: Duration,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            supervisor,
            containers,
            attach_delay,
            completion_poll_interval,
            output_dir,
        }
    }

    pub async fn run(&self, bag_paths: &[PathBuf], image_tag: &str) -> OpenLoopReport {
        let run_id = Uuid::new_v4().to_string();
        info!(%run_id, bags = bag_paths.len(), image_tag, "starting open-loop test");

        // Validate the whole sequence before any container exists.
        for bag_path in bag_paths {
            if !bag_path.exists() {
                let message = format!("bag path does not exist: {}", bag_path.display());
                warn!(%run_id, %message, "open-loop test rejected");
                return OpenLoopReport {
                    success: false,
                    message,
                    run_id,
                    container_id: None,
                    results: Vec::new(),
                    output_paths: Vec::new(),
                    error: None,
                };
            }
        }

        let mut results = Vec::new();
        let mut container_id = None;
        match self
            .execute(bag_paths, image_tag, &mut results, &mut container_id)
            .await
        {
            Ok(output_paths) => {
                info!(%run_id, bags = results.len(), "open-loop test completed");
                OpenLoopReport {
                    success: true,
                    message: format!("open-loop test completed for {} bags", results.len()),
                    run_id,
                    container_id,
                    results,
                    output_paths,
                    error: None,
                }
            }
            Err(error) => {
                // No rollback: the container (and possibly a live playback)
                // is left behind for manual inspection.
                warn!(%run_id, error = format!("{error:#}"), "open-loop test aborted");
                OpenLoopReport {
                    success: false,
                    message: "open-loop test aborted".to_string(),
                    run_id,
                    container_id,
                    results,
                    output_paths: Vec::new(),
                    error: Some(format!("{error:#}")),
                }
            }
        }
    }

    async fn execute(
        &self,
        bag_paths: &[PathBuf],
        image_tag: &str,
        results: &mut Vec<BagRunOutcome>,
        container_id: &mut Option<String>,
    ) -> Result<Vec<PathBuf>> {
        let options = RunContainerOptions {
            name: CONTAINER_NAME.to_string(),
            network: CONTAINER_NETWORK.to_string(),
            command: BOOTSTRAP_COMMAND.map(str::to_string).to_vec(),
        };
        let id = self.containers.run_container(image_tag, &options).await?;
        *container_id = Some(id.clone());

        for (index, bag_path) in bag_paths.iter().enumerate() {
            let sequence = index + 1;
            info!(
                sequence,
                total = bag_paths.len(),
                bag = %bag_path.display(),
                "processing bag"
            );

            self.play_and_wait(bag_path).await?;
            results.push(BagRunOutcome {
                bag_path: bag_path.clone(),
                outcome: "completed".to_string(),
                sequence,
            });

            // The workload needs a clean container state per bag.
            if sequence < bag_paths.len() {
                self.containers.stop_container(&id).await?;
                self.containers.start_container(&id).await?;
            }
        }

        self.containers.stop_container(&id).await?;

        let lidar_out = self.output_dir.join("lidar");
        let estimation_out = self.output_dir.join("estimation");
        self.containers
            .copy_from_container(&id, LIDAR_EVALUATION_DIR, &lidar_out)
            .await?;
        self.containers
            .copy_from_container(&id, ESTIMATION_EVALUATION_DIR, &estimation_out)
            .await?;
        self.containers.remove_container(&id).await?;

        Ok(vec![lidar_out, estimation_out])
    }

    async fn play_and_wait(&self, bag_path: &Path) -> Result<()> {
        let request = PlaybackRequest::new(bag_path);
        let started = self
            .supervisor
            .start(&request)
            .await
            .with_context(|| format!("failed to start playback: {}", bag_path.display()))?;
        if !started {
            bail!(
                "playback monitor did not stay alive for {}",
                bag_path.display()
            );
        }

        tokio::time::sleep(self.attach_delay).await;

        // The player exposes no completion callback, so this is a poll loop.
        // It has no timeout: a wedged player stalls the whole sequence.
        while self.supervisor.status().running {
            tokio::time::sleep(self.completion_poll_interval).await;
        }

        // Teardown even when the player exited on its own.
        let message = self.supervisor.stop().await;
        debug!(%message, "playback teardown");

        // The monitor clears the slot asynchronously; the next start would
        // see Busy until it does.
        while self.supervisor.status().monitor_alive {
            tokio::time::sleep(crate::player::MONITOR_POLL_INTERVAL).await;
        }
        Ok(())
    }
}
