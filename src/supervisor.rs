/// Single worker invocation: spawn the worker in its own process group, wait
/// for it in bounded windows, and decide after each elapsed window whether it
/// is still making progress.
use crate::config::{MemoryConfig, WorkerConfig};
use crate::guard::{signal_group, ActiveGroup, GroupGuard};
use crate::monitor::{
    extract_item_identifier, is_memory_low, log_len, read_snapshot, snapshot_app_log,
    tail_lines, truncate_log, ProgressState,
};
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::{JoinError, JoinHandle};

/// Why the supervisor terminated the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// Opening the same item across two consecutive windows.
    StuckOpening,
    /// Sustained low-memory warnings in the application log.
    LowMemory,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The worker exited on its own.
    Completed { exit_code: Option<i32> },
    /// The supervisor killed the worker. `item` is what the progress log
    /// named at kill time, if anything.
    Killed {
        item: Option<String>,
        reason: KillReason,
    },
}

impl Verdict {
    pub fn killed_item(&self) -> Option<&str> {
        match self {
            Verdict::Killed { item, .. } => item.as_deref(),
            Verdict::Completed { .. } => None,
        }
    }
}

/// Values substituted into the worker argument template.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub batch_input: PathBuf,
    pub output_dir: PathBuf,
    pub model_config: PathBuf,
    pub stats_output: PathBuf,
    pub timeout_log: PathBuf,
}

/// A fully resolved worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// Replace `{batch_input}`, `{output_dir}`, `{model_config}`,
    /// `{stats_output}` and `{timeout_log}` placeholders in the configured args.
    pub fn from_template(worker: &WorkerConfig, values: &WorkerArgs) -> Self {
        let pairs = [
            ("{batch_input}", &values.batch_input),
            ("{output_dir}", &values.output_dir),
            ("{model_config}", &values.model_config),
            ("{stats_output}", &values.stats_output),
            ("{timeout_log}", &values.timeout_log),
        ];
        let args = worker
            .args
            .iter()
            .map(|arg| {
                pairs.iter().fold(arg.clone(), |acc, (placeholder, path)| {
                    acc.replace(placeholder, &path.to_string_lossy())
                })
            })
            .collect();
        Self {
            program: worker.command.clone(),
            args,
        }
    }
}

/// Low-memory detection settings for one invocation.
#[derive(Debug, Clone)]
pub struct MemoryCheck {
    pub app_log: PathBuf,
    pub snapshot: PathBuf,
    pub marker: String,
    pub tail_lines: usize,
    pub warning_threshold: usize,
}

impl MemoryCheck {
    pub fn from_config(app_log: &Path, snapshot: PathBuf, memory: &MemoryConfig) -> Self {
        Self {
            app_log: app_log.to_path_buf(),
            snapshot,
            marker: memory.marker.clone(),
            tail_lines: memory.tail_lines,
            warning_threshold: memory.warning_threshold,
        }
    }

    /// Only lines written after byte offset `since` count, so warnings left
    /// by an earlier worker cannot kill this one.
    fn is_low(&self, since: u64) -> bool {
        let text = snapshot_app_log(&self.app_log, &self.snapshot, since);
        is_memory_low(
            &tail_lines(&text, self.tail_lines),
            &self.marker,
            self.warning_threshold,
        )
    }
}

#[derive(Debug, Clone)]
pub struct SuperviseOptions {
    pub timeout: Duration,
    pub progress_log: PathBuf,
    pub opening_marker: String,
    pub memory: Option<MemoryCheck>,
}

/// Errors that can occur while supervising a worker.
#[derive(Debug)]
pub enum SupervisorError {
    /// Failed to spawn the worker.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The spawned worker reported no pid.
    NoPid,
    /// Waiting on the worker failed.
    Wait { source: std::io::Error },
    /// The background wait task panicked or was cancelled.
    Join { source: JoinError },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Spawn { program, source } => {
                write!(f, "failed to spawn worker {program}: {source}")
            }
            SupervisorError::NoPid => write!(f, "worker exited before reporting a pid"),
            SupervisorError::Wait { source } => write!(f, "failed to wait on worker: {source}"),
            SupervisorError::Join { source } => write!(f, "worker wait task failed: {source}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Spawn { source, .. } => Some(source),
            SupervisorError::NoPid => None,
            SupervisorError::Wait { source } => Some(source),
            SupervisorError::Join { source } => Some(source),
        }
    }
}

type WaitTask = JoinHandle<std::io::Result<ExitStatus>>;

fn exit_status(
    joined: Result<std::io::Result<ExitStatus>, JoinError>,
) -> Result<ExitStatus, SupervisorError> {
    joined
        .map_err(|e| SupervisorError::Join { source: e })?
        .map_err(|e| SupervisorError::Wait { source: e })
}

/// Run one worker invocation to its verdict.
///
/// There is no overall deadline: the worker runs as long as each elapsed
/// window shows progress.
pub async fn supervise(
    command: &WorkerCommand,
    opts: &SuperviseOptions,
    active: &ActiveGroup,
) -> Result<Verdict, SupervisorError> {
    tracing::info!(
        program = %command.program,
        args = ?command.args,
        "spawning worker"
    );

    let app_log_start = opts.memory.as_ref().map_or(0, |m| log_len(&m.app_log));
    tracing::debug!(app_log_start, "application log offset at spawn");

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|e| SupervisorError::Spawn {
            program: command.program.clone(),
            source: e,
        })?;

    let pid = child.id().ok_or(SupervisorError::NoPid)?;
    let mut guard = GroupGuard::acquire(active, pid as i32);

    let mut wait_task: WaitTask = tokio::spawn(async move {
        tracing::info!(pid, "wait task started");
        let status = child.wait().await;
        tracing::info!(pid, "wait task finished");
        status
    });

    let mut previous = ProgressState::default();
    loop {
        tracing::debug!(timeout_ms = opts.timeout.as_millis() as u64, "waiting for worker exit");
        let joined = match tokio::time::timeout(opts.timeout, &mut wait_task).await {
            Ok(joined) => joined,
            Err(_) => {
                let snapshot = read_snapshot(&opts.progress_log);
                let snapshot = snapshot.trim();
                tracing::info!(progress = snapshot, "timeout reached, checking worker state");

                if opts.memory.as_ref().is_some_and(|m| m.is_low(app_log_start)) {
                    let item = extract_item_identifier(snapshot);
                    tracing::warn!(item = ?item, "sustained low memory, terminating worker");
                    terminate(&opts.progress_log, &mut guard, &mut wait_task).await?;
                    return Ok(Verdict::Killed {
                        item,
                        reason: KillReason::LowMemory,
                    });
                }

                let state = ProgressState::from_snapshot(snapshot, &opts.opening_marker);
                if state.is_stuck_after(&previous) {
                    tracing::warn!(
                        item = ?state.current_item,
                        "opening took too long, terminating worker"
                    );
                    terminate(&opts.progress_log, &mut guard, &mut wait_task).await?;
                    return Ok(Verdict::Killed {
                        item: state.current_item,
                        reason: KillReason::StuckOpening,
                    });
                }

                if state.is_opening {
                    tracing::info!(item = ?state.current_item, "opening detected");
                } else {
                    tracing::info!("worker state ok");
                }
                previous = state;
                continue;
            }
        };

        let status = exit_status(joined)?;
        guard.disarm();
        tracing::info!(exit_code = ?status.code(), "worker finished on its own");
        return Ok(Verdict::Completed {
            exit_code: status.code(),
        });
    }
}

/// Clear the progress log, then kill the group and wait for it to exit.
///
/// The log is cleared first so a stale "opening" line cannot leak into the
/// next invocation.
async fn terminate(
    progress_log: &Path,
    guard: &mut GroupGuard,
    wait_task: &mut WaitTask,
) -> Result<(), SupervisorError> {
    if let Err(e) = truncate_log(progress_log) {
        tracing::warn!(
            error = %e,
            path = %progress_log.display(),
            "failed to clear progress log"
        );
    }
    signal_group(guard.pgid(), Signal::SIGTERM);

    let status = exit_status(wait_task.await)?;
    guard.disarm();
    tracing::info!(exit_code = ?status.code(), "killed worker exited");
    Ok(())
}
