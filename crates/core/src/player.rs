use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PlaybackConfig;

/// Interval between liveness polls of the player process.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long `start` waits before confirming the monitor task survived launch.
pub const LAUNCH_CONFIRM_WAIT: Duration = Duration::from_millis(100);
/// Grace period between SIGTERM and SIGKILL when stopping the player.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);

const OUTPUT_TAIL_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("a bag is being played now")]
    Busy,
    #[error("bag file does not exist: {}", .0.display())]
    BagNotFound(PathBuf),
    #[error("failed to launch player process: {0}")]
    Launch(#[source] std::io::Error),
}

/// One playback request. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub bag_path: PathBuf,
    /// Topic filters; empty plays all topics.
    pub topics: Vec<String>,
    pub loop_playback: bool,
    pub publish_clock: bool,
}

impl PlaybackRequest {
    pub fn new(bag_path: impl Into<PathBuf>) -> Self {
        Self {
            bag_path: bag_path.into(),
            topics: Vec::new(),
            loop_playback: false,
            publish_clock: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PlaybackStatus {
    pub running: bool,
    pub monitor_alive: bool,
}

#[derive(Default)]
struct PlaybackSlot {
    child: Option<Child>,
    cancel: Option<CancellationToken>,
    monitor_alive: bool,
}

/// Owns the single playback slot: at most one player process is active at a
/// time, and every transition of the slot goes through one mutex.
pub struct PlaybackSupervisor {
    config: PlaybackConfig,
    slot: Arc<Mutex<PlaybackSlot>>,
}

impl PlaybackSupervisor {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(PlaybackSlot::default())),
        }
    }

    /// Launch a player process for the request and a monitor task that owns
    /// its lifecycle. Returns whether the monitor is still alive after a
    /// short bounded wait — not a guarantee the player itself finished
    /// initializing.
    pub async fn start(&self, request: &PlaybackRequest) -> Result<bool, PlaybackError> {
        if !request.bag_path.exists() {
            return Err(PlaybackError::BagNotFound(request.bag_path.clone()));
        }

        let (bin, args) = playback_command(&self.config, request);
        let cancel = CancellationToken::new();
        let output_tail = OutputTail::default();

        {
            // Busy check and slot installation are one critical section, so
            // concurrent starts cannot both win the slot.
            let mut slot = lock_slot(&self.slot);
            if slot.monitor_alive {
                return Err(PlaybackError::Busy);
            }

            let mut command = Command::new(&bin);
            command
                .args(&args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = command.spawn().map_err(PlaybackError::Launch)?;
            if let Some(stdout) = child.stdout.take() {
                spawn_output_drain(stdout, output_tail.clone(), false);
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_output_drain(stderr, output_tail.clone(), true);
            }

            info!(
                bag = %request.bag_path.display(),
                command = %bin,
                "started bag playback"
            );

            slot.child = Some(child);
            slot.cancel = Some(cancel.clone());
            slot.monitor_alive = true;
        }

        tokio::spawn(monitor_playback(
            Arc::clone(&self.slot),
            cancel,
            output_tail,
        ));

        tokio::time::sleep(LAUNCH_CONFIRM_WAIT).await;
        Ok(self.status().monitor_alive)
    }

    /// Stop the active playback, if any. Safe to call at any time, including
    /// concurrently with the monitor observing a natural exit.
    pub async fn stop(&self) -> String {
        let (child, cancel) = {
            let mut slot = lock_slot(&self.slot);
            if !slot.monitor_alive && slot.child.is_none() {
                return "no playback in progress".to_string();
            }
            (slot.child.take(), slot.cancel.clone())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        match child {
            Some(child) => {
                terminate_child(child).await;
                info!("stopped bag playback");
                "stopped bag playback".to_string()
            }
            // The monitor already took the handle; teardown is its job.
            None => "playback already shutting down".to_string(),
        }
    }

    /// Current slot state. Reads only in-memory flags under the mutex; never
    /// waits on the player process.
    pub fn status(&self) -> PlaybackStatus {
        let mut slot = lock_slot(&self.slot);
        let process_running = slot
            .child
            .as_mut()
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false);
        PlaybackStatus {
            running: process_running && slot.monitor_alive,
            monitor_alive: slot.monitor_alive,
        }
    }
}

/// Build the player invocation for a request. With source scripts
/// configured the whole command line is wrapped in `/bin/bash -c` so the
/// player sees the sourced environment.
fn playback_command(config: &PlaybackConfig, request: &PlaybackRequest) -> (String, Vec<String>) {
    let mut args = config.player_args.clone();
    args.push(request.bag_path.to_string_lossy().into_owned());
    if request.loop_playback {
        args.push("--loop".to_string());
    }
    if request.publish_clock {
        args.push("--clock".to_string());
    }
    if !request.topics.is_empty() {
        args.push("--topics".to_string());
        args.extend(request.topics.iter().cloned());
    }

    if config.source_scripts.is_empty() {
        return (config.player_bin.clone(), args);
    }

    let mut shell_command = String::new();
    for script in &config.source_scripts {
        shell_command.push_str(&format!("source {} && ", script.display()));
    }
    shell_command.push_str(&config.player_bin);
    for arg in &args {
        shell_command.push(' ');
        shell_command.push_str(arg);
    }

    (
        "/bin/bash".to_string(),
        vec!["-c".to_string(), shell_command],
    )
}

fn lock_slot(slot: &Mutex<PlaybackSlot>) -> MutexGuard<'_, PlaybackSlot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Clears the slot when the monitor task ends, on every exit path.
struct SlotReset {
    slot: Arc<Mutex<PlaybackSlot>>,
}

impl Drop for SlotReset {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        // Any leftover handle is reaped via kill_on_drop.
        slot.child = None;
        slot.cancel = None;
        slot.monitor_alive = false;
    }
}

enum PollOutcome {
    Running,
    Reclaimed,
    Exited(ExitStatus),
    PollFailed(std::io::Error),
}

async fn monitor_playback(
    slot: Arc<Mutex<PlaybackSlot>>,
    cancel: CancellationToken,
    output_tail: OutputTail,
) {
    let _reset = SlotReset {
        slot: Arc::clone(&slot),
    };

    loop {
        if cancel.is_cancelled() {
            let child = lock_slot(&slot).child.take();
            if let Some(child) = child {
                info!("cancellation observed, terminating player");
                terminate_child(child).await;
            }
            return;
        }

        let outcome = {
            let mut guard = lock_slot(&slot);
            match guard.child.as_mut() {
                None => PollOutcome::Reclaimed,
                Some(child) => match child.try_wait() {
                    Ok(None) => PollOutcome::Running,
                    Ok(Some(status)) => {
                        guard.child = None;
                        PollOutcome::Exited(status)
                    }
                    Err(error) => {
                        guard.child = None;
                        PollOutcome::PollFailed(error)
                    }
                },
            }
        };

        match outcome {
            PollOutcome::Running => {}
            // stop() took the handle and owns teardown.
            PollOutcome::Reclaimed => return,
            PollOutcome::Exited(status) if status.success() => {
                info!("player exited cleanly");
                return;
            }
            PollOutcome::Exited(status) => {
                warn!(
                    %status,
                    output_tail = %output_tail.render(),
                    "player exited abnormally"
                );
                return;
            }
            PollOutcome::PollFailed(error) => {
                warn!(error = %error, "failed to poll player process");
                return;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
        }
    }
}

/// SIGTERM first; SIGKILL once the grace period elapses.
async fn terminate_child(mut child: Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
        match tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "player terminated"),
            Ok(Err(error)) => warn!(error = %error, "failed waiting for player to terminate"),
            Err(_) => {
                warn!("player ignored SIGTERM within grace period, killing");
                if let Err(error) = child.kill().await {
                    warn!(error = %error, "failed to kill player process");
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(error) = child.kill().await {
            warn!(error = %error, "failed to kill player process");
        }
    }
}

/// Bounded buffer of the most recent player output lines, kept for
/// abnormal-exit diagnostics.
#[derive(Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn render(&self) -> String {
        let lines = match self.lines.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn spawn_output_drain<R>(stream: R, tail: OutputTail, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            if is_stderr {
                debug!(target: "player_stderr", "{line}");
            } else {
                debug!(target: "player_stdout", "{line}");
            }
            tail.push(line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlaybackConfig;

    fn test_supervisor(script: &str) -> PlaybackSupervisor {
        PlaybackSupervisor::new(PlaybackConfig {
            player_bin: "/bin/sh".to_string(),
            player_args: vec!["-c".to_string(), script.to_string()],
            source_scripts: Vec::new(),
            ..PlaybackConfig::default()
        })
    }

    fn existing_bag(temp: &tempfile::TempDir) -> PathBuf {
        let path = temp.path().join("run_0.db3");
        std::fs::write(&path, b"bag").expect("bag file should be written");
        path
    }

    async fn wait_until_idle(supervisor: &PlaybackSupervisor) {
        for _ in 0..100 {
            if !supervisor.status().monitor_alive {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("supervisor did not return to idle");
    }

    #[tokio::test]
    async fn start_with_missing_bag_fails_not_found() {
        let supervisor = test_supervisor("sleep 30");
        let request = PlaybackRequest::new("/definitely/not/here.db3");

        let err = supervisor.start(&request).await.unwrap_err();
        assert!(matches!(err, PlaybackError::BagNotFound(_)));

        // a failed start leaves the slot reusable
        let temp = tempfile::tempdir().unwrap();
        let request = PlaybackRequest::new(existing_bag(&temp));
        assert!(supervisor.start(&request).await.unwrap());
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn second_start_fails_busy() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("sleep 30");
        let request = PlaybackRequest::new(existing_bag(&temp));

        assert!(supervisor.start(&request).await.unwrap());
        let err = supervisor.start(&request).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Busy));

        // first session unaffected
        assert!(supervisor.status().running);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("sleep 30");
        let request = PlaybackRequest::new(existing_bag(&temp));

        let (first, second) = tokio::join!(supervisor.start(&request), supervisor.start(&request));
        let successes = [&first, &second]
            .iter()
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(successes, 1, "exactly one concurrent start may win");
        assert!(
            [first, second]
                .into_iter()
                .any(|result| matches!(result, Err(PlaybackError::Busy))),
            "the loser must observe Busy"
        );

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn status_tracks_running_session() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("sleep 30");
        let request = PlaybackRequest::new(existing_bag(&temp));

        let idle = supervisor.status();
        assert!(!idle.running);
        assert!(!idle.monitor_alive);

        assert!(supervisor.start(&request).await.unwrap());
        let active = supervisor.status();
        assert!(active.running);
        assert!(active.monitor_alive);

        supervisor.stop().await;
        assert!(!supervisor.status().running);
    }

    #[tokio::test]
    async fn natural_exit_returns_to_idle() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("true");
        let request = PlaybackRequest::new(existing_bag(&temp));

        // process exits almost immediately; start may or may not still see
        // the monitor alive, but the slot must drain to idle either way
        let _ = supervisor.start(&request).await.unwrap();
        wait_until_idle(&supervisor).await;
        assert!(!supervisor.status().running);
    }

    #[tokio::test]
    async fn abnormal_exit_is_absorbed() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("echo boom >&2; exit 3");
        let request = PlaybackRequest::new(existing_bag(&temp));

        let _ = supervisor.start(&request).await.unwrap();
        wait_until_idle(&supervisor).await;
        assert!(!supervisor.status().running);

        // slot is reusable after a failed playback
        assert!(supervisor.start(&request).await.is_ok());
        wait_until_idle(&supervisor).await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("sleep 30");

        assert_eq!(supervisor.stop().await, "no playback in progress");

        let request = PlaybackRequest::new(existing_bag(&temp));
        assert!(supervisor.start(&request).await.unwrap());
        assert_eq!(supervisor.stop().await, "stopped bag playback");

        wait_until_idle(&supervisor).await;
        assert_eq!(supervisor.stop().await, "no playback in progress");
    }

    #[tokio::test]
    async fn start_stop_round_trip_restores_idle() {
        let temp = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor("sleep 30");
        let before = supervisor.status();

        let request = PlaybackRequest::new(existing_bag(&temp));
        assert!(supervisor.start(&request).await.unwrap());
        supervisor.stop().await;
        wait_until_idle(&supervisor).await;

        assert_eq!(supervisor.status(), before);

        // and the slot accepts a fresh session
        assert!(supervisor.start(&request).await.unwrap());
        supervisor.stop().await;
    }

    #[test]
    fn playback_command_basic_args() {
        let config = PlaybackConfig::default();
        let request = PlaybackRequest::new("/bags/run_0");

        let (bin, args) = playback_command(&config, &request);
        assert_eq!(bin, "ros2");
        assert_eq!(args, vec!["bag", "play", "/bags/run_0", "--clock"]);
    }

    #[test]
    fn playback_command_full_flags() {
        let config = PlaybackConfig::default();
        let request = PlaybackRequest {
            bag_path: PathBuf::from("/bags/run_0"),
            topics: vec!["/vehicle/odom".to_string(), "/lidar/points".to_string()],
            loop_playback: true,
            publish_clock: true,
        };

        let (_, args) = playback_command(&config, &request);
        let loop_idx = args.iter().position(|a| a == "--loop").unwrap();
        let clock_idx = args.iter().position(|a| a == "--clock").unwrap();
        let topics_idx = args.iter().position(|a| a == "--topics").unwrap();
        assert!(loop_idx < clock_idx && clock_idx < topics_idx);
        assert_eq!(args[topics_idx + 1], "/vehicle/odom");
        assert_eq!(args[topics_idx + 2], "/lidar/points");
    }

    #[test]
    fn playback_command_without_clock() {
        let config = PlaybackConfig::default();
        let request = PlaybackRequest {
            publish_clock: false,
            ..PlaybackRequest::new("/bags/run_0")
        };

        let (_, args) = playback_command(&config, &request);
        assert!(!args.contains(&"--clock".to_string()));
    }

    #[test]
    fn playback_command_wraps_source_scripts_in_bash() {
        let config = PlaybackConfig {
            source_scripts: vec![
                PathBuf::from("/opt/ros/galactic/setup.bash"),
                PathBuf::from("/home/driverless/workspace/install/setup.bash"),
            ],
            ..PlaybackConfig::default()
        };
        let request = PlaybackRequest::new("/bags/run_0");

        let (bin, args) = playback_command(&config, &request);
        assert_eq!(bin, "/bin/bash");
        assert_eq!(args[0], "-c");
        let shell = &args[1];
        assert!(shell.starts_with("source /opt/ros/galactic/setup.bash && "));
        assert!(shell.contains("source /home/driverless/workspace/install/setup.bash && "));
        assert!(shell.ends_with("ros2 bag play /bags/run_0 --clock"));
    }

    #[test]
    fn output_tail_is_bounded() {
        let tail = OutputTail::default();
        for i in 0..(OUTPUT_TAIL_LINES + 10) {
            tail.push(format!("line {i}"));
        }
        let rendered = tail.render();
        assert!(!rendered.contains("line 0"));
        assert!(rendered.contains(&format!("line {}", OUTPUT_TAIL_LINES + 9)));
        assert_eq!(rendered.lines().count(), OUTPUT_TAIL_LINES);
    }
}
