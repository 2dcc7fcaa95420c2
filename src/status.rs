/// Status file: writes `status.json` on every run state transition.
///
/// Uses atomic write pattern: write to a temp file in the same directory,
/// then rename over the target.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Run states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Starting,
    BatchRunning,
    WatchdogKill,
    BatchFinished,
    Finished,
}

/// The JSON payload written to `status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub state: RunState,
    pub batch: u32,
    pub processed: usize,
    pub total: usize,
    pub queued: usize,
    pub current_batch: Vec<String>,
    pub last_killed: Option<String>,
    pub run_start: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StatusError::Write {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| StatusError::Write {
                path: tmp.path().to_path_buf(),
                source: e,
            })?;
        tmp.persist(&self.path).map_err(|e| StatusError::Persist {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Remove the status file.
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Mutable state tracker that builds StatusData for each update.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    batch: u32,
    processed: usize,
    total: usize,
    queued: usize,
    current_batch: Vec<String>,
    last_killed: Option<String>,
    run_start: DateTime<Utc>,
}

impl StatusTracker {
    pub fn new(status_path: PathBuf, total: usize) -> Self {
        Self {
            file: StatusFile::new(status_path),
            pid: std::process::id(),
            batch: 0,
            processed: 0,
            total,
            queued: total,
            current_batch: Vec::new(),
            last_killed: None,
            run_start: Utc::now(),
        }
    }

    /// Write the status file with the given state. Failures are logged only.
    pub fn update(&self, state: RunState) {
        let data = self.snapshot(state);
        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    pub fn snapshot(&self, state: RunState) -> StatusData {
        StatusData {
            pid: self.pid,
            state,
            batch: self.batch,
            processed: self.processed,
            total: self.total,
            queued: self.queued,
            current_batch: self.current_batch.clone(),
            last_killed: self.last_killed.clone(),
            run_start: self.run_start,
            last_update: Utc::now(),
        }
    }

    /// Record the batch about to run.
    pub fn set_batch(&mut self, batch: u32, names: Vec<String>, queued: usize) {
        self.batch = batch;
        self.current_batch = names;
        self.queued = queued;
    }

    pub fn set_progress(&mut self, processed: usize, queued: usize) {
        self.processed = processed;
        self.queued = queued;
    }

    pub fn set_last_killed(&mut self, item: Option<String>) {
        self.last_killed = item;
    }

    pub fn remove(&self) {
        self.file.remove();
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Persist { path, source } => {
                write!(f, "failed to replace {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Persist { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_status_file_atomic_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut tracker = StatusTracker::new(path.clone(), 5);
        tracker.set_batch(1, vec!["p1".to_string(), "p2".to_string()], 3);
        tracker.update(RunState::BatchRunning);

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["state"], "batch_running");
        assert_eq!(parsed["batch"], 1);
        assert_eq!(parsed["total"], 5);
        assert_eq!(parsed["queued"], 3);
        assert_eq!(parsed["current_batch"][1], "p2");
        assert!(parsed["last_killed"].is_null());

        // No temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_status_overwrite_tracks_kill() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let mut tracker = StatusTracker::new(path.clone(), 5);
        tracker.update(RunState::Starting);

        tracker.set_progress(1, 3);
        tracker.set_last_killed(Some("p2".to_string()));
        tracker.update(RunState::WatchdogKill);

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["state"], "watchdog_kill");
        assert_eq!(parsed["processed"], 1);
        assert_eq!(parsed["last_killed"], "p2");
    }

    #[test]
    fn test_all_run_states_serialize() {
        let cases = [
            (RunState::Starting, "\"starting\""),
            (RunState::BatchRunning, "\"batch_running\""),
            (RunState::WatchdogKill, "\"watchdog_kill\""),
            (RunState::BatchFinished, "\"batch_finished\""),
            (RunState::Finished, "\"finished\""),
        ];
        for (state, expected) in cases {
            assert_eq!(serde_json::to_string(&state).unwrap(), expected);
        }
    }

    #[test]
    fn test_status_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let tracker = StatusTracker::new(path.clone(), 0);
        tracker.update(RunState::Finished);
        assert!(path.exists());
        tracker.remove();
        assert!(!path.exists());
    }

    #[test]
    fn test_write_to_nonexistent_dir_fails() {
        let sf = StatusFile::new(PathBuf::from("/nonexistent-dir/status.json"));
        let tracker = StatusTracker::new(PathBuf::from("/unused"), 0);
        let err = sf.write(&tracker.snapshot(RunState::Starting)).unwrap_err();
        assert!(matches!(err, StatusError::Write { .. }));
        assert!(err.to_string().contains("failed to write temp status file"));
    }
}
