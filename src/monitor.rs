/// Progress monitoring: classify worker state from log snapshots.
///
/// The worker is opaque; its progress log and application log are the only
/// observable channel. Everything here is plain text matching over a snapshot
/// taken at poll time.
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

/// First bracket-delimited token, non-greedy.
static ITEM_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(.*?)\]").unwrap());

/// Worker state derived from one progress-log snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProgressState {
    pub is_opening: bool,
    pub current_item: Option<String>,
}

impl ProgressState {
    pub fn from_snapshot(text: &str, opening_marker: &str) -> Self {
        Self {
            is_opening: classify_opening(text, opening_marker),
            current_item: extract_item_identifier(text),
        }
    }

    /// True when both polls saw the worker opening the same item.
    pub fn is_stuck_after(&self, previous: &ProgressState) -> bool {
        previous.is_opening && self.is_opening && previous.current_item == self.current_item
    }
}

/// Substring containment of the marker. Unrelated text containing the marker
/// also counts.
pub fn classify_opening(text: &str, marker: &str) -> bool {
    text.contains(marker)
}

/// Interior of the first `[...]` token, if any.
pub fn extract_item_identifier(text: &str) -> Option<String> {
    ITEM_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// The last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].to_vec()
}

/// Debounced memory-pressure signal: true once `threshold` lines in the
/// window carry the marker.
pub fn is_memory_low(lines: &[&str], marker: &str, threshold: usize) -> bool {
    let count = lines.iter().filter(|line| line.contains(marker)).count();
    tracing::debug!(count, threshold, "low memory warnings in tail window");
    count >= threshold
}

/// Read a log snapshot. A missing or unreadable file reads as empty.
///
/// Bytes that are not valid UTF-8 are replaced, so a stray byte in the log
/// never hides the rest of it.
pub fn read_snapshot(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            tracing::debug!(
                error = %e,
                path = %path.display(),
                "log not readable, treating as empty"
            );
            String::new()
        }
    }
}

/// Current size of a log in bytes, 0 when it does not exist.
pub fn log_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Copy the application log to `snapshot` and return what the snapshot holds
/// past byte offset `since`.
///
/// The worker keeps appending to its log, so the decision is made on a
/// stable local copy. A log shorter than `since` has been rotated or
/// truncated and is read from the start.
pub fn snapshot_app_log(app_log: &Path, snapshot: &Path, since: u64) -> String {
    if let Err(e) = std::fs::copy(app_log, snapshot) {
        tracing::debug!(
            error = %e,
            path = %app_log.display(),
            "failed to snapshot application log"
        );
        return String::new();
    }
    let bytes = match std::fs::read(snapshot) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!(
                error = %e,
                path = %snapshot.display(),
                "application log snapshot not readable"
            );
            return String::new();
        }
    };
    let start = usize::try_from(since)
        .ok()
        .filter(|&start| start <= bytes.len())
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[start..]).into_owned()
}

/// Truncate the progress log to empty, creating it if missing.
pub fn truncate_log(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, "")
}
