use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Manages the `.rebooter/` directory layout.
///
/// Everything the supervisor itself writes lives under one run directory.
/// The worker's own logs and outputs live wherever the CLI points them.
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

/// Exclusive hold on a run directory. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

/// Errors from run directory operations.
#[derive(Debug)]
pub enum RunDirError {
    Init {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another supervisor already holds the lock.
    Locked { path: PathBuf },
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RunDirError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunDirError::Init { path, source } => {
                write!(f, "failed to create run directory {}: {source}", path.display())
            }
            RunDirError::Locked { path } => write!(
                f,
                "another rebooter is already running (lock held on {})",
                path.display()
            ),
            RunDirError::Lock { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for RunDirError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunDirError::Init { source, .. } => Some(source),
            RunDirError::Locked { .. } => None,
            RunDirError::Lock { source, .. } => Some(source),
        }
    }
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the JSON status file.
    pub fn status(&self) -> PathBuf {
        self.root.join("status.json")
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// File handed to the worker listing the current batch.
    pub fn batch_input(&self) -> PathBuf {
        self.root.join("batch_input.txt")
    }

    /// Local copy of the worker's application log taken at poll time.
    pub fn app_log_snapshot(&self) -> PathBuf {
        self.root.join("app-log-snapshot.log")
    }

    /// Directory of numbered application log archives.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// The supervisor's own append-only diagnostic log.
    pub fn diagnostic_log(&self) -> PathBuf {
        self.root.join("rebooter.log")
    }

    /// Create the root and `logs/`. Returns Ok(true) if the root was created.
    pub fn init(&self) -> Result<bool, RunDirError> {
        let created = !self.root.exists();
        for dir in [self.root.clone(), self.logs_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| RunDirError::Init {
                path: dir.clone(),
                source: e,
            })?;
        }
        Ok(created)
    }

    /// Take the exclusive run lock without blocking.
    pub fn acquire_lock(&self) -> Result<RunLock, RunDirError> {
        let path = self.lock();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| RunDirError::Lock {
                path: path.clone(),
                source: e,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(RunLock { _file: file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(RunDirError::Locked { path })
            }
            Err(e) => Err(RunDirError::Lock { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dir_paths() {
        let rd = RunDir::new(".rebooter");
        assert_eq!(rd.root(), Path::new(".rebooter"));
        assert_eq!(rd.status(), PathBuf::from(".rebooter/status.json"));
        assert_eq!(rd.lock(), PathBuf::from(".rebooter/lock"));
        assert_eq!(rd.batch_input(), PathBuf::from(".rebooter/batch_input.txt"));
        assert_eq!(rd.logs_dir(), PathBuf::from(".rebooter/logs"));
        assert_eq!(rd.diagnostic_log(), PathBuf::from(".rebooter/rebooter.log"));
    }

    #[test]
    fn test_init_creates_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path().join(".rebooter"));

        assert!(rd.init().unwrap());
        assert!(rd.logs_dir().is_dir());
        assert!(!rd.init().unwrap());
    }

    #[test]
    fn test_second_lock_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let rd = RunDir::new(tmp.path());
        rd.init().unwrap();

        let held = rd.acquire_lock().unwrap();
        let err = rd.acquire_lock().unwrap_err();
        assert!(matches!(err, RunDirError::Locked { .. }));
        assert!(err.to_string().contains("already running"));

        drop(held);
        assert!(rd.acquire_lock().is_ok());
    }
}
