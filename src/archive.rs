//! Numbered archives of the worker's application log.
//!
//! After every invocation the application log is copied to
//! `logs/app-log-{N}.log`. Numbers continue past whatever is already in the
//! directory, so archives from earlier runs are never overwritten. Archives
//! older than the newest `compress_after` can be compressed to `.log.zst`.

use std::path::{Path, PathBuf};

const PREFIX: &str = "app-log-";

/// Writer for numbered application log archives.
#[derive(Debug)]
pub struct LogArchive {
    dir: PathBuf,
    next: u64,
}

impl LogArchive {
    /// Open (creating if needed) the archive directory and find the next free number.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let next = existing_numbers(dir)?
            .into_iter()
            .max()
            .map_or(0, |n| n + 1);
        Ok(Self {
            dir: dir.to_path_buf(),
            next,
        })
    }

    /// Number the next archive will get.
    pub fn next_number(&self) -> u64 {
        self.next
    }

    /// Copy `src` into the next numbered archive slot.
    ///
    /// A missing source is logged and skipped; the number is not consumed.
    pub fn archive(&mut self, src: &Path) -> Option<PathBuf> {
        let dest = self.dir.join(format!("{PREFIX}{}.log", self.next));
        match std::fs::copy(src, &dest) {
            Ok(bytes) => {
                tracing::info!(
                    src = %src.display(),
                    dest = %dest.display(),
                    bytes,
                    "archived application log"
                );
                self.next += 1;
                Some(dest)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    src = %src.display(),
                    "failed to archive application log"
                );
                None
            }
        }
    }

    /// Compress every plain archive except the newest `keep_plain`.
    ///
    /// Errors on individual files are logged but do not stop processing.
    pub fn compress_old(&self, keep_plain: u32) {
        if keep_plain == 0 {
            return;
        }

        let mut plain = match plain_archives(&self.dir) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read archive directory for compression");
                return;
            }
        };
        if plain.len() <= keep_plain as usize {
            return;
        }
        plain.sort_by_key(|(n, _)| *n);
        let cutoff = plain.len() - keep_plain as usize;

        for (number, path) in &plain[..cutoff] {
            if let Err(e) = compress_file(path) {
                tracing::warn!(
                    error = %e,
                    file = %path.display(),
                    "failed to compress archived log"
                );
            } else {
                tracing::debug!(file = %path.display(), number, "compressed archived log");
            }
        }
    }
}

/// Parse the archive number out of `app-log-{N}.log` or `app-log-{N}.log.zst`.
fn archive_number(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(PREFIX)?;
    let digits = rest
        .strip_suffix(".log.zst")
        .or_else(|| rest.strip_suffix(".log"))?;
    digits.parse().ok()
}

fn existing_numbers(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        if let Some(n) = entry.file_name().to_str().and_then(archive_number) {
            numbers.push(n);
        }
    }
    Ok(numbers)
}

fn plain_archives(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".log") {
            continue;
        }
        if let Some(n) = archive_number(name) {
            found.push((n, path));
        }
    }
    Ok(found)
}

/// Compress a single file with zstd, writing to `{path}.zst` and removing the original.
fn compress_file(path: &Path) -> std::io::Result<()> {
    let dest = path.with_extension("log.zst");
    let input = std::fs::read(path)?;
    let compressed = zstd::encode_all(input.as_slice(), 3)?;
    std::fs::write(&dest, compressed)?;
    std::fs::remove_file(path)?;
    Ok(())
}
