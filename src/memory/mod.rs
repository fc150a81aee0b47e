//! `MemoryStore`: append-only markdown memory over a workspace
//! directory. `MEMORY.md` holds the rolling working set; `memory/
//! YYYY-MM-DD.md` holds the day's raw event log. Trim and compaction
//! keep both bounded without ever deleting a line the caller marked
//! keep-always.

mod compaction;

pub use compaction::{CompactionOutcome, compact};

use std::path::{Path, PathBuf};

use chrono::Utc;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::config::CompactionConfig;
use crate::error::{CoreError, Result};

const TAG_ESCAPE: &AsciiSet = &CONTROLS.add(b';').add(b'=').add(b']').add(b'%');

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLayer {
    Core,
    Daily,
}

#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub key: String,
    pub value: String,
    pub layer: MemoryLayer,
    pub provenance_source_class: String,
    pub provenance_reference: String,
    pub keep_always: bool,
}

pub struct MemoryStore {
    workspace_dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }

    pub fn core_path(&self) -> PathBuf {
        self.workspace_dir.join("MEMORY.md")
    }

    pub fn daily_path(&self, date: chrono::NaiveDate) -> PathBuf {
        self.workspace_dir.join("memory").join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Append one tagged line to the record's target file (core for
    /// `MemoryLayer::Core`, today's daily file otherwise). Never removes
    /// existing lines: the whole file is read, the header is added if the
    /// file is new, the line is appended, and the whole thing is
    /// rewritten.
    pub fn append_event(&self, record: &MemoryRecord) -> Result<()> {
        let path = match record.layer {
            MemoryLayer::Core => self.core_path(),
            MemoryLayer::Daily => self.daily_path(Utc::now().date_naive()),
        };
        self.append_line(&path, &render_line(record))
    }

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Other(e.into()))?;
        }

        let mut existing = std::fs::read_to_string(path).unwrap_or_default();
        if existing.is_empty() {
            existing.push_str(&format!("# {}\n\n", header_for(path)));
        }
        if !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(line);
        existing.push('\n');

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &existing).map_err(|e| CoreError::Other(e.into()))?;
        std::fs::rename(&tmp, path).map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    /// Keyword-overlap scored recall over the core memory file's lines.
    pub fn recall_scoped(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let contents = std::fs::read_to_string(self.core_path()).unwrap_or_default();
        let query_terms: Vec<String> = query.to_lowercase().split_whitespace().map(str::to_string).collect();

        let mut scored: Vec<(usize, &str)> = contents
            .lines()
            .filter(|l| l.trim_start().starts_with("- **"))
            .map(|line| {
                let lower = line.to_lowercase();
                let score = query_terms.iter().filter(|t| lower.contains(t.as_str())).count();
                (score, line)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(scored.into_iter().take(limit).map(|(_, l)| l.to_string()).collect())
    }

    /// Trim the core file down to `config.max_records`/`config.max_chars`,
    /// archiving anything dropped rather than discarding it, unless the
    /// line is tagged keep-always.
    pub fn trim(&self, config: &CompactionConfig) -> Result<CompactionOutcome> {
        compaction::trim_core_file(&self.core_path(), config)
    }
}

fn header_for(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("memory").to_string()
}

fn render_line(record: &MemoryRecord) -> String {
    let layer = match record.layer {
        MemoryLayer::Core => "core",
        MemoryLayer::Daily => "daily",
    };
    format!(
        "- **{}** [md:layer={};provenance_source_class={};provenance_reference={}{}]: {}",
        record.key,
        layer,
        encode_tag_value(&record.provenance_source_class),
        encode_tag_value(&record.provenance_reference),
        if record.keep_always { ";keep_always=true" } else { "" },
        record.value,
    )
}

pub fn encode_tag_value(value: &str) -> String {
    utf8_percent_encode(value, TAG_ESCAPE).to_string()
}

pub fn decode_tag_value(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, keep_always: bool) -> MemoryRecord {
        MemoryRecord {
            key: key.to_string(),
            value: "some observed fact".to_string(),
            layer: MemoryLayer::Core,
            provenance_source_class: "tool_output".to_string(),
            provenance_reference: "run:abc123".to_string(),
            keep_always,
        }
    }

    #[test]
    fn append_event_creates_header_then_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append_event(&record("pref.tone", false)).unwrap();
        store.append_event(&record("pref.timezone", false)).unwrap();

        let contents = std::fs::read_to_string(store.core_path()).unwrap();
        assert!(contents.starts_with("# MEMORY"));
        assert_eq!(contents.lines().filter(|l| l.starts_with("- **")).count(), 2);
    }

    #[test]
    fn tag_values_with_special_characters_round_trip() {
        let encoded = encode_tag_value("source=web;ref]broken%");
        assert!(!encoded.contains(';'));
        assert!(!encoded.contains(']'));
        let decoded = decode_tag_value(&encoded);
        assert_eq!(decoded, "source=web;ref]broken%");
    }

    #[test]
    fn recall_scoped_ranks_by_keyword_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append_event(&record("pref.editor", false)).unwrap();
        let mut r2 = record("pref.language", false);
        r2.value = "prefers rust and cargo tooling".to_string();
        store.append_event(&r2).unwrap();

        let results = store.recall_scoped("rust cargo", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].contains("rust"));
    }

    #[test]
    fn daily_path_is_scoped_by_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let date = chrono::NaiveDate::from_ymd_opt(2026, 7, 26).unwrap();
        let path = store.daily_path(date);
        assert!(path.ends_with("memory/2026-07-26.md"));
    }
}
