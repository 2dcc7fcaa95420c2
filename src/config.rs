use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from rebooter.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct RebooterConfig {
    pub worker: WorkerConfig,
    pub batch: BatchConfig,
    pub watchdog: WatchdogConfig,
    pub memory: MemoryConfig,
    pub storage: StorageConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_secs: u64,
    pub opening_marker: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Worker application log. Empty disables the low-memory check.
    pub app_log: PathBuf,
    pub marker: String,
    pub tail_lines: usize,
    pub warning_threshold: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub run_dir: PathBuf,
    /// Newest archives kept uncompressed; 0 disables compression.
    pub compress_after: u32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub keep_on_finish: bool,
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl RebooterConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: RebooterConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch.size == 0 {
            return Err(ConfigError::Invalid("batch.size must be at least 1".into()));
        }
        if self.watchdog.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.timeout_secs must be at least 1".into(),
            ));
        }
        if self.watchdog.opening_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "watchdog.opening_marker must not be empty".into(),
            ));
        }
        if self.memory.marker.is_empty() {
            return Err(ConfigError::Invalid("memory.marker must not be empty".into()));
        }
        if self.memory.tail_lines == 0 {
            return Err(ConfigError::Invalid(
                "memory.tail_lines must be at least 1".into(),
            ));
        }
        if self.memory.warning_threshold == 0 {
            return Err(ConfigError::Invalid(
                "memory.warning_threshold must be at least 1".into(),
            ));
        }
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.command is empty".into()));
        }
        Ok(())
    }

    /// The application log path, or `None` when the memory check is disabled.
    pub fn app_log(&self) -> Option<&Path> {
        if self.memory.app_log.as_os_str().is_empty() {
            None
        } else {
            Some(&self.memory.app_log)
        }
    }
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "./comment_update_miner.sh".to_string(),
            args: vec![
                "{batch_input}".to_string(),
                "{output_dir}".to_string(),
                "{model_config}".to_string(),
                "{stats_output}".to_string(),
                "{timeout_log}".to_string(),
            ],
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { size: 5 }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3,
            opening_marker: "opening".to_string(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            app_log: PathBuf::new(),
            marker: "Low memory".to_string(),
            tail_lines: 60,
            warning_threshold: 4,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(".rebooter"),
            compress_after: 0,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            keep_on_finish: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RebooterConfig::default();
        assert_eq!(config.batch.size, 5);
        assert_eq!(config.watchdog.timeout_secs, 3);
        assert_eq!(config.watchdog.opening_marker, "opening");
        assert_eq!(config.memory.marker, "Low memory");
        assert_eq!(config.memory.tail_lines, 60);
        assert_eq!(config.memory.warning_threshold, 4);
        assert_eq!(config.worker.args.len(), 5);
        assert!(config.app_log().is_none());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RebooterConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.batch.size, 5);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebooter.toml");
        std::fs::write(
            &path,
            "[batch]\nsize = 2\n\n[memory]\napp_log = \"/var/log/idea.log\"\n",
        )
        .unwrap();

        let config = RebooterConfig::load(&path).unwrap();
        assert_eq!(config.batch.size, 2);
        assert_eq!(config.watchdog.timeout_secs, 3);
        assert_eq!(config.app_log(), Some(Path::new("/var/log/idea.log")));
        assert_eq!(config.memory.warning_threshold, 4);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebooter.toml");
        std::fs::write(&path, "[batch\nsize = ").unwrap();
        let err = RebooterConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebooter.toml");
        std::fs::write(&path, "[batch]\nsize = 0\n").unwrap();
        let err = RebooterConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("batch.size"));
    }

    fn load_err(contents: &str) -> ConfigError {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebooter.toml");
        std::fs::write(&path, contents).unwrap();
        RebooterConfig::load(&path).unwrap_err()
    }

    #[test]
    fn test_empty_memory_marker_rejected() {
        let err = load_err("[memory]\nmarker = \"\"\n");
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("memory.marker"));
    }

    #[test]
    fn test_zero_tail_lines_rejected() {
        let err = load_err("[memory]\ntail_lines = 0\n");
        assert!(err.to_string().contains("memory.tail_lines"));
    }

    #[test]
    fn test_zero_warning_threshold_rejected() {
        let err = load_err("[memory]\nwarning_threshold = 0\n");
        assert!(err.to_string().contains("memory.warning_threshold"));
    }
}
