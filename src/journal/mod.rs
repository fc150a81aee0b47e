//! `DecisionJournal`: an append-only, size-rotated record of every
//! policy-relevant decision (tool executed, tool denied, approval
//! requested/resolved). `ObservationStore` is the sibling bounded ring
//! buffer for raw tool/adapter observations kept for debugging, not
//! audit.

mod observation;

pub use observation::{Observation, ObservationStore};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::DecisionJournalReplayMode;
use crate::error::{CoreError, Result};

const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: String,
    pub tool: Option<String>,
    pub request_id: Option<String>,
    pub detail: Value,
}

enum Backend {
    File { path: PathBuf, max_bytes: u64 },
    InMemory(Vec<JournalEntry>),
}

pub struct DecisionJournal {
    backend: Mutex<Backend>,
}

impl DecisionJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: Mutex::new(Backend::File {
                path: path.into(),
                max_bytes: DEFAULT_MAX_BYTES,
            }),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Mutex::new(Backend::InMemory(Vec::new())),
        }
    }

    fn write_entry(&self, entry: JournalEntry) {
        let mut guard = self.backend.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *guard {
            Backend::InMemory(entries) => entries.push(entry),
            Backend::File { path, max_bytes } => {
                if let Err(err) = append_to_file(path, *max_bytes, &entry) {
                    tracing::warn!(error = %err, "failed to persist decision journal entry");
                }
            }
        }
    }

    pub fn record_tool_executed(&self, tool: &str, truncated: bool) {
        self.write_entry(JournalEntry {
            timestamp: Utc::now(),
            kind: "tool_executed".to_string(),
            tool: Some(tool.to_string()),
            request_id: None,
            detail: serde_json::json!({"truncated": truncated}),
        });
    }

    pub fn record_tool_denied(&self, tool: &str, reason: &str) {
        self.write_entry(JournalEntry {
            timestamp: Utc::now(),
            kind: "tool_denied".to_string(),
            tool: Some(tool.to_string()),
            request_id: None,
            detail: serde_json::json!({"reason": reason}),
        });
    }

    pub fn record_approval_requested(&self, tool: &str, request_id: Uuid, deduplicated: bool) {
        self.write_entry(JournalEntry {
            timestamp: Utc::now(),
            kind: "approval_requested".to_string(),
            tool: Some(tool.to_string()),
            request_id: Some(request_id.to_string()),
            detail: serde_json::json!({"deduplicated": deduplicated}),
        });
    }

    pub fn record_approval_resolved(&self, request_id: Uuid, approved: bool) {
        self.write_entry(JournalEntry {
            timestamp: Utc::now(),
            kind: "approval_resolved".to_string(),
            tool: None,
            request_id: Some(request_id.to_string()),
            detail: serde_json::json!({"approved": approved}),
        });
    }

    /// Read all entries back, tolerating corrupted lines (a line that
    /// fails to parse is skipped rather than failing the whole read).
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        let guard = self.backend.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*guard {
            Backend::InMemory(entries) => Ok(entries.clone()),
            Backend::File { path, .. } => read_entries(path),
        }
    }

    /// The last `limit` entries in append order, used for turn context
    /// assembly. Cheaper callers than `read_all` followed by a slice.
    pub fn read_recent(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut entries = self.read_all()?;
        if entries.len() > limit {
            entries.drain(..entries.len() - limit);
        }
        Ok(entries)
    }

    /// Entries for replay per `continuity.decisionJournalReplayMode`:
    /// a fixed count, everything since `since_hours` ago, or (when no
    /// session-start marker is tracked here) the same since-hours
    /// fallback for `since_last_session`.
    pub fn read_entries_for_replay(&self, mode: DecisionJournalReplayMode, limit: usize, since_hours: i64) -> Result<Vec<JournalEntry>> {
        match mode {
            DecisionJournalReplayMode::Count => self.read_recent(limit),
            DecisionJournalReplayMode::SinceHours | DecisionJournalReplayMode::SinceLastSession => {
                let cutoff = Utc::now() - chrono::Duration::hours(since_hours);
                let mut entries: Vec<JournalEntry> = self
                    .read_all()?
                    .into_iter()
                    .filter(|e| e.timestamp >= cutoff)
                    .collect();
                if entries.len() > limit {
                    entries.drain(..entries.len() - limit);
                }
                Ok(entries)
            }
        }
    }
}

fn append_to_file(path: &Path, max_bytes: u64, entry: &JournalEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CoreError::Other(e.into()))?;
    }

    rotate_if_needed(path, max_bytes)?;

    let line = serde_json::to_string(entry).map_err(|e| CoreError::Other(e.into()))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::Other(e.into()))?;
    writeln!(file, "{line}").map_err(|e| CoreError::Other(e.into()))?;
    Ok(())
}

/// When the journal file exceeds `max_bytes`, move it to a single `.1`
/// generation (overwriting any prior one) and start a fresh file.
fn rotate_if_needed(path: &Path, max_bytes: u64) -> Result<()> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    if meta.len() < max_bytes {
        return Ok(());
    }
    let rotated = path.with_extension("1");
    std::fs::rename(path, rotated).map_err(|e| CoreError::Other(e.into()))?;
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<JournalEntry>> {
    let mut entries = Vec::new();
    for candidate in [path.with_extension("1"), path.to_path_buf()] {
        let Ok(contents) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping corrupted decision journal line");
                }
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_journal_records_entries() {
        let journal = DecisionJournal::new_in_memory();
        journal.record_tool_executed("exec", false);
        journal.record_tool_denied("exec", "not allow-listed");
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "tool_executed");
        assert_eq!(entries[1].kind, "tool_denied");
    }

    #[test]
    fn file_journal_persists_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        let journal = DecisionJournal::new(&path);
        journal.record_tool_executed("web_fetch", true);
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool.as_deref(), Some("web_fetch"));
    }

    #[test]
    fn corrupted_line_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        std::fs::write(&path, "{not json}\n{\"timestamp\":\"2024-01-01T00:00:00Z\",\"kind\":\"tool_executed\",\"tool\":null,\"request_id\":null,\"detail\":null}\n").unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn rotation_moves_oversized_file_to_generation_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        std::fs::write(&path, "x".repeat(100)).unwrap();
        rotate_if_needed(&path, 10).unwrap();
        assert!(!path.exists());
        assert!(path.with_extension("1").exists());
    }
}
