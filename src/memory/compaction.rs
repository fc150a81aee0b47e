//! Rolling-window trim for the core memory file. Runs opportunistically
//! (heartbeat tick) rather than on every append, guarded by a lock file
//! so two trims never race.

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CompactionConfig;
use crate::error::{CoreError, Result};

pub struct CompactionOutcome {
    pub kept: usize,
    pub archived: usize,
}

/// Partition the core file's record lines into keep-always and
/// compactable, then drop compactable lines beyond `max_records`/
/// `max_chars`, oldest first, archiving what's dropped unless
/// `config.archive_trimmed` is false.
pub fn trim_core_file(path: &Path, config: &CompactionConfig) -> Result<CompactionOutcome> {
    let _guard = LockFile::acquire(path)?;

    let contents = fs::read_to_string(path).unwrap_or_default();
    let mut header_lines = Vec::new();
    let mut record_lines = Vec::new();

    for line in contents.lines() {
        if line.trim_start().starts_with("- **") {
            record_lines.push(line.to_string());
        } else if record_lines.is_empty() {
            header_lines.push(line.to_string());
        }
    }

    let (keep_always, compactable): (Vec<String>, Vec<String>) =
        record_lines.into_iter().partition(|l| l.contains("keep_always=true"));

    let mut kept_compactable = compactable;
    let mut archived = Vec::new();

    while kept_compactable.len() > config.max_records {
        archived.push(kept_compactable.remove(0));
    }

    let mut total_chars: usize = keep_always.iter().chain(kept_compactable.iter()).map(|l| l.len()).sum();
    while total_chars > config.max_chars && !kept_compactable.is_empty() {
        let dropped = kept_compactable.remove(0);
        total_chars -= dropped.len();
        archived.push(dropped);
    }

    let mut rebuilt = header_lines.join("\n");
    if !rebuilt.is_empty() {
        rebuilt.push('\n');
    }
    for line in keep_always.iter().chain(kept_compactable.iter()) {
        rebuilt.push_str(line);
        rebuilt.push('\n');
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &rebuilt).map_err(|e| CoreError::Other(e.into()))?;
    fs::rename(&tmp, path).map_err(|e| CoreError::Other(e.into()))?;

    if config.archive_trimmed && !archived.is_empty() {
        archive(path, &archived)?;
    }

    Ok(CompactionOutcome {
        kept: keep_always.len() + kept_compactable.len(),
        archived: archived.len(),
    })
}

fn archive(core_path: &Path, lines: &[String]) -> Result<()> {
    let archive_path = core_path.with_file_name("MEMORY.archive.md");
    let mut existing = fs::read_to_string(&archive_path).unwrap_or_default();
    for line in lines {
        existing.push_str(line);
        existing.push('\n');
    }
    fs::write(&archive_path, existing).map_err(|e| CoreError::Other(e.into()))?;
    Ok(())
}

struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(core_path: &Path) -> Result<Self> {
        let path = core_path.with_extension("lock");
        match fs::OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(CoreError::Other(anyhow::anyhow!("compaction already in progress")))
            }
            Err(e) => Err(CoreError::Other(e.into())),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_records: usize, max_chars: usize) -> CompactionConfig {
        CompactionConfig {
            max_records,
            max_chars,
            min_age_days: 7,
            compacted_text_truncate_chars: 4000,
            long_memory_cap_blocks: 200,
            archive_trimmed: true,
        }
    }

    #[test]
    fn trim_drops_oldest_beyond_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        let lines: Vec<String> = (0..5)
            .map(|i| format!("- **k{i}** [md:layer=core]: value {i}"))
            .collect();
        fs::write(&path, lines.join("\n")).unwrap();

        let outcome = trim_core_file(&path, &config(3, 100_000)).unwrap();
        assert_eq!(outcome.kept, 3);
        assert_eq!(outcome.archived, 2);

        let remaining = fs::read_to_string(&path).unwrap();
        assert!(remaining.contains("k2"));
        assert!(!remaining.contains("k0"));
    }

    #[test]
    fn keep_always_lines_survive_trim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        fs::write(
            &path,
            "- **k0** [md:layer=core;keep_always=true]: never drop\n- **k1** [md:layer=core]: droppable\n",
        )
        .unwrap();

        let outcome = trim_core_file(&path, &config(0, 100_000)).unwrap();
        assert_eq!(outcome.archived, 1);
        let remaining = fs::read_to_string(&path).unwrap();
        assert!(remaining.contains("never drop"));
    }

    #[test]
    fn archived_lines_are_written_to_archive_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("MEMORY.md");
        fs::write(&path, "- **k0** [md:layer=core]: value 0\n").unwrap();
        trim_core_file(&path, &config(0, 100_000)).unwrap();
        let archive_contents = fs::read_to_string(dir.path().join("MEMORY.archive.md")).unwrap();
        assert!(archive_contents.contains("value 0"));
    }
}
