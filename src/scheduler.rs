/// Batch scheduling: split the dataset into fixed-size batches, run each batch
/// under the supervisor, and fold the residue of killed batches back into the
/// front of the queue.
use crate::archive::LogArchive;
use crate::config::WorkerConfig;
use crate::guard::ActiveGroup;
use crate::run_dir::RunDir;
use crate::status::{RunState, StatusTracker};
use crate::supervisor::{
    supervise, SuperviseOptions, SupervisorError, Verdict, WorkerArgs, WorkerCommand,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// One unit of work, usually a project path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component. This is the name the worker reports in its
    /// progress log.
    pub fn short_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pending work, consumed from the front.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
}

impl WorkQueue {
    pub fn from_items(items: Vec<WorkItem>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove up to `size` items from the front.
    pub fn next_batch(&mut self, size: usize) -> Vec<WorkItem> {
        let take = size.min(self.items.len());
        self.items.drain(..take).collect()
    }

    /// Put `items` back at the front, keeping their order.
    pub fn requeue_front(&mut self, items: Vec<WorkItem>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn short_names(&self) -> Vec<&str> {
        self.items.iter().map(WorkItem::short_name).collect()
    }
}

/// What one verdict did to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub abandoned: Option<WorkItem>,
    pub requeued: usize,
}

/// Apply a verdict to the queue.
///
/// A kill naming an item at position K counts K items as processed, drops
/// the item itself and requeues everything after it. Any other verdict,
/// including a kill on an unknown or unmatched item, counts the whole batch.
pub fn apply_verdict(
    mut batch: Vec<WorkItem>,
    verdict: &Verdict,
    queue: &mut WorkQueue,
) -> BatchOutcome {
    let whole_batch = BatchOutcome {
        processed: batch.len(),
        abandoned: None,
        requeued: 0,
    };

    let Some(killed) = verdict.killed_item() else {
        if matches!(verdict, Verdict::Killed { .. }) {
            tracing::warn!("worker killed on an unknown item, batch residue is not requeued");
        }
        return whole_batch;
    };

    let Some(pos) = batch.iter().position(|item| item.short_name() == killed) else {
        tracing::warn!(item = killed, "killed item not found in batch, residue is not requeued");
        return whole_batch;
    };

    let residue = batch.split_off(pos + 1);
    let abandoned = batch.pop();
    let requeued = residue.len();
    queue.requeue_front(residue);

    tracing::info!(
        item = killed,
        position = pos,
        requeued,
        "abandoned killed item, requeued the rest of the batch"
    );
    BatchOutcome {
        processed: pos,
        abandoned,
        requeued,
    }
}

/// Write the batch input file: one item per line, no trailing newline.
pub fn write_batch_input(path: &Path, batch: &[WorkItem]) -> std::io::Result<()> {
    let contents = batch
        .iter()
        .map(WorkItem::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    std::fs::write(path, contents)
}

/// Read the dataset: one item per line, blank lines skipped.
pub fn load_dataset(path: &Path) -> std::io::Result<Vec<WorkItem>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(WorkItem::new)
        .collect())
}

/// Batches the first pass would form if every batch completed.
pub fn plan_batches(items: &[WorkItem], size: usize) -> Vec<Vec<WorkItem>> {
    items.chunks(size.max(1)).map(<[WorkItem]>::to_vec).collect()
}

/// Result of a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub batches: u32,
    pub abandoned: Vec<WorkItem>,
}

impl RunSummary {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            batches: 0,
            abandoned: Vec::new(),
        }
    }

    fn record(&mut self, outcome: BatchOutcome) {
        self.processed += outcome.processed;
        if let Some(item) = outcome.abandoned {
            self.abandoned.push(item);
        }
    }
}

/// Everything the scheduler needs besides the dataset.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub batch_size: usize,
    pub worker: WorkerConfig,
    pub output_dir: PathBuf,
    pub model_config: PathBuf,
    pub stats_output: PathBuf,
    /// Progress log path; also handed to the worker as `{timeout_log}`.
    pub supervise: SuperviseOptions,
    /// Application log to archive after each invocation.
    pub app_log: Option<PathBuf>,
    pub compress_after: u32,
    pub keep_status: bool,
}

impl SchedulerSettings {
    fn worker_args(&self, batch_input: PathBuf) -> WorkerArgs {
        WorkerArgs {
            batch_input,
            output_dir: self.output_dir.clone(),
            model_config: self.model_config.clone(),
            stats_output: self.stats_output.clone(),
            timeout_log: self.supervise.progress_log.clone(),
        }
    }
}

/// Errors that stop a run.
#[derive(Debug)]
pub enum SchedulerError {
    BatchInput {
        path: PathBuf,
        source: std::io::Error,
    },
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },
    Supervisor(SupervisorError),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::BatchInput { path, source } => {
                write!(f, "failed to write batch input {}: {source}", path.display())
            }
            SchedulerError::Archive { path, source } => {
                write!(f, "failed to open log archive {}: {source}", path.display())
            }
            SchedulerError::Supervisor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SchedulerError::BatchInput { source, .. } => Some(source),
            SchedulerError::Archive { source, .. } => Some(source),
            SchedulerError::Supervisor(e) => Some(e),
        }
    }
}

impl From<SupervisorError> for SchedulerError {
    fn from(e: SupervisorError) -> Self {
        SchedulerError::Supervisor(e)
    }
}

/// Drives the work queue through the supervisor, one batch at a time.
pub struct BatchScheduler {
    settings: SchedulerSettings,
    run_dir: RunDir,
    active: ActiveGroup,
}

impl BatchScheduler {
    pub fn new(settings: SchedulerSettings, run_dir: RunDir, active: ActiveGroup) -> Self {
        Self {
            settings,
            run_dir,
            active,
        }
    }

    pub async fn run(&self, items: Vec<WorkItem>) -> Result<RunSummary, SchedulerError> {
        let total = items.len();
        let mut queue = WorkQueue::from_items(items);
        let mut summary = RunSummary::new(total);

        let logs_dir = self.run_dir.logs_dir();
        let mut archive = LogArchive::open(&logs_dir).map_err(|e| SchedulerError::Archive {
            path: logs_dir.clone(),
            source: e,
        })?;

        let mut status = StatusTracker::new(self.run_dir.status(), total);
        status.update(RunState::Starting);
        tracing::info!(
            total,
            batch_size = self.settings.batch_size,
            next_archive = archive.next_number(),
            "starting batch run"
        );

        while !queue.is_empty() {
            tracing::info!(queue = ?queue.short_names(), "pending items");
            let batch = queue.next_batch(self.settings.batch_size);
            summary.batches += 1;

            let batch_input = self.run_dir.batch_input();
            write_batch_input(&batch_input, &batch).map_err(|e| SchedulerError::BatchInput {
                path: batch_input.clone(),
                source: e,
            })?;
            let args = self.settings.worker_args(batch_input);
            let command = WorkerCommand::from_template(&self.settings.worker, &args);

            let names = batch.iter().map(|i| i.short_name().to_string()).collect();
            status.set_batch(summary.batches, names, queue.len());
            status.update(RunState::BatchRunning);
            tracing::info!(batch = summary.batches, size = batch.len(), "running batch");

            let verdict = supervise(&command, &self.settings.supervise, &self.active).await?;
            let killed = matches!(verdict, Verdict::Killed { .. });
            status.set_last_killed(verdict.killed_item().map(str::to_string));

            let outcome = apply_verdict(batch, &verdict, &mut queue);
            summary.record(outcome);

            if let Some(app_log) = &self.settings.app_log {
                archive.archive(app_log);
                archive.compress_old(self.settings.compress_after);
            }

            status.set_progress(summary.processed, queue.len());
            status.update(if killed {
                RunState::WatchdogKill
            } else {
                RunState::BatchFinished
            });
            tracing::info!(
                processed = summary.processed,
                total,
                queued = queue.len(),
                "batch done"
            );
        }

        status.update(RunState::Finished);
        if !self.settings.keep_status {
            status.remove();
        }
        tracing::info!(
            processed = summary.processed,
            total,
            batches = summary.batches,
            abandoned = summary.abandoned.len(),
            "run finished"
        );
        Ok(summary)
    }
}
