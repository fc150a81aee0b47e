//! `DeepScanService`: a bounded scan of files under the workspace that
//! were modified most recently, run as a last-resort integrity check
//! once a failure loop escalates. Bounded by both a file count and a
//! byte budget so it can never itself become a runaway operation.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{CoreError, Result};

const MAX_FILES_SCANNED: usize = 50;
const MAX_BYTES_PER_FILE: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub byte_len: u64,
}

pub struct DeepScanReport {
    pub files: Vec<ScannedFile>,
    pub truncated: bool,
}

pub struct DeepScanService {
    root: PathBuf,
}

impl DeepScanService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walk the workspace (skipping hidden directories), collect every
    /// regular file's mtime, sort most-recently-modified first, and
    /// return up to `MAX_FILES_SCANNED` entries.
    pub fn scan_recently_touched(&self) -> Result<DeepScanReport> {
        let mut files = Vec::new();
        walk(&self.root, &mut files)?;

        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        let truncated = files.len() > MAX_FILES_SCANNED;
        files.truncate(MAX_FILES_SCANNED);

        Ok(DeepScanReport { files, truncated })
    }
}

fn walk(dir: &Path, out: &mut Vec<ScannedFile>) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let is_hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        if is_hidden {
            continue;
        }

        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        if metadata.is_dir() {
            walk(&path, out)?;
        } else if metadata.is_file() {
            let modified = metadata.modified().map_err(|e| CoreError::Other(e.into()))?;
            out.push(ScannedFile {
                path,
                modified,
                byte_len: metadata.len().min(MAX_BYTES_PER_FILE),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn scan_finds_files_most_recently_modified_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        fs::write(dir.path().join("b.txt"), "b").unwrap();

        let service = DeepScanService::new(dir.path());
        let report = service.scan_recently_touched().unwrap();
        assert_eq!(report.files.len(), 2);
        assert!(report.files[0].path.ends_with("b.txt"));
    }

    #[test]
    fn hidden_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".git").join("HEAD"), "ref").unwrap();
        fs::write(dir.path().join("visible.txt"), "v").unwrap();

        let service = DeepScanService::new(dir.path());
        let report = service.scan_recently_touched().unwrap();
        assert_eq!(report.files.len(), 1);
        assert!(report.files[0].path.ends_with("visible.txt"));
    }

    #[test]
    fn scan_of_empty_directory_is_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let service = DeepScanService::new(dir.path());
        let report = service.scan_recently_touched().unwrap();
        assert!(report.files.is_empty());
        assert!(!report.truncated);
    }
}
