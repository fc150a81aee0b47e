//! Typed configuration shape for the execution core.
//!
//! Loading mechanics (file watching, hot reload) are out of scope — this
//! module defines the shape every component reads from, parsed once at
//! startup from TOML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "defaults::max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "defaults::max_messages_per_turn")]
    pub max_messages_per_turn: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_chars: defaults::max_message_chars(),
            max_messages_per_turn: defaults::max_messages_per_turn(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "defaults::heartbeat_min_ms")]
    pub min_ms: u64,
    #[serde(default = "defaults::heartbeat_max_ms")]
    pub max_ms: u64,
    #[serde(default = "defaults::heartbeat_initial_ms")]
    pub initial_ms: u64,
    /// Inactive window (consecutive empty ticks) after which the interval
    /// collapses straight to `max_ms`.
    #[serde(default = "defaults::heartbeat_inactive_ticks")]
    pub inactive_collapse_ticks: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            min_ms: defaults::heartbeat_min_ms(),
            max_ms: defaults::heartbeat_max_ms(),
            initial_ms: defaults::heartbeat_initial_ms(),
            inactive_collapse_ticks: defaults::heartbeat_inactive_ticks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "defaults::max_records")]
    pub max_records: usize,
    #[serde(default = "defaults::max_chars")]
    pub max_chars: usize,
    #[serde(default = "defaults::min_age_days")]
    pub min_age_days: i64,
    #[serde(default = "defaults::compaction_truncate_chars")]
    pub compacted_text_truncate_chars: usize,
    #[serde(default = "defaults::long_memory_cap_blocks")]
    pub long_memory_cap_blocks: usize,
    #[serde(default)]
    pub archive_trimmed: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_records: defaults::max_records(),
            max_chars: defaults::max_chars(),
            min_age_days: defaults::min_age_days(),
            compacted_text_truncate_chars: defaults::compaction_truncate_chars(),
            long_memory_cap_blocks: defaults::long_memory_cap_blocks(),
            archive_trimmed: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub allow_secret_recall: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub fail_closed_on_error: bool,
    #[serde(default = "defaults::entropy_min_len")]
    pub entropy_min_len: usize,
    #[serde(default = "defaults::entropy_min_bits")]
    pub entropy_min_bits: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            fail_closed_on_error: false,
            entropy_min_len: defaults::entropy_min_len(),
            entropy_min_bits: defaults::entropy_min_bits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "defaults::scheduler_poll_secs")]
    pub scheduler_poll_secs: u64,
    #[serde(default = "defaults::scheduler_retries")]
    pub scheduler_retries: u32,
    #[serde(default = "defaults::provider_backoff_ms")]
    pub provider_backoff_ms: u64,
    #[serde(default = "defaults::provider_retries")]
    pub provider_retries: u32,
    #[serde(default = "defaults::max_concurrent_runs")]
    pub max_concurrent_cron_runs: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            scheduler_poll_secs: defaults::scheduler_poll_secs(),
            scheduler_retries: defaults::scheduler_retries(),
            provider_backoff_ms: defaults::provider_backoff_ms(),
            provider_retries: defaults::provider_retries(),
            max_concurrent_cron_runs: defaults::max_concurrent_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default = "defaults::exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default = "defaults::exec_max_buffer_bytes")]
    pub exec_max_buffer_bytes: usize,
    #[serde(default = "defaults::fetch_max_body_bytes")]
    pub fetch_max_body_bytes: usize,
    #[serde(default = "defaults::fetch_max_redirects")]
    pub fetch_max_redirects: u8,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            forbidden_paths: Vec::new(),
            exec_timeout_secs: defaults::exec_timeout_secs(),
            exec_max_buffer_bytes: defaults::exec_max_buffer_bytes(),
            fetch_max_body_bytes: defaults::fetch_max_body_bytes(),
            fetch_max_redirects: defaults::fetch_max_redirects(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub default_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub use_only_validated_fallbacks: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: "ollama:llama3".to_string(),
            fallback_models: Vec::new(),
            use_only_validated_fallbacks: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyBudgetConfig {
    #[serde(default = "defaults::budget_per_hour")]
    pub max_per_hour: usize,
    #[serde(default = "defaults::budget_per_day")]
    pub max_per_day: usize,
    /// UTC hour [0,24) at which quiet hours begin.
    pub quiet_hours_start_utc: Option<u8>,
    /// UTC hour [0,24) at which quiet hours end (wrap-around supported).
    pub quiet_hours_end_utc: Option<u8>,
}

impl Default for AutonomyBudgetConfig {
    fn default() -> Self {
        Self {
            max_per_hour: defaults::budget_per_hour(),
            max_per_day: defaults::budget_per_day(),
            quiet_hours_start_utc: None,
            quiet_hours_end_utc: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionJournalReplayMode {
    #[default]
    Count,
    SinceHours,
    SinceLastSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityConfig {
    #[serde(default)]
    pub decision_journal_replay_mode: DecisionJournalReplayMode,
    #[serde(default = "defaults::replay_count")]
    pub replay_count: usize,
    #[serde(default = "defaults::replay_since_hours")]
    pub replay_since_hours: i64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            decision_journal_replay_mode: DecisionJournalReplayMode::default(),
            replay_count: defaults::replay_count(),
            replay_since_hours: defaults::replay_since_hours(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueDropStrategy {
    #[default]
    DropOldest,
    DeferNew,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderModelResilienceConfig {
    #[serde(default)]
    pub queue_drop_strategy: QueueDropStrategy,
}

/// Top-level configuration. Groups named in the spec but owned by
/// out-of-scope collaborators (`gateway`, `mcp`, `workspaces`,
/// `contextCompression`, `networkTrace`, `reflection`, `metrics`) are not
/// modeled as typed fields here; unrecognized TOML tables are ignored by
/// serde's default behavior rather than rejected, so a config file that
/// also configures those collaborators still parses.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub autonomy_budget: AutonomyBudgetConfig,
    #[serde(default)]
    pub continuity: ContinuityConfig,
    #[serde(default)]
    pub provider_model_resilience: ProviderModelResilienceConfig,
    /// Dev-mode flag: permits placeholder credentials (`changeme`) during
    /// `validate()`.
    #[serde(default)]
    pub dev_mode: bool,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("reading config {path:?}: {e}")))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("parsing config {path:?}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects placeholder credentials (`changeme`) and literal
    /// `"undefined"`/`"null"` token strings unless `dev_mode` is set.
    pub fn validate(&self) -> Result<()> {
        if self.dev_mode {
            return Ok(());
        }
        if self.models.default_model.trim().is_empty() {
            return Err(CoreError::Other(anyhow::anyhow!(
                "models.default_model must not be empty"
            )));
        }
        for token in [
            self.models.default_model.as_str(),
            self.workspace_dir.to_string_lossy().as_ref(),
        ] {
            if is_placeholder_value(token) {
                return Err(CoreError::Other(anyhow::anyhow!(
                    "config contains placeholder value {token:?}; set dev_mode to allow"
                )));
            }
        }
        Ok(())
    }
}

fn is_placeholder_value(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "changeme" | "undefined" | "null"
    )
}

mod defaults {
    pub fn max_message_chars() -> usize {
        12_000
    }
    pub fn max_messages_per_turn() -> usize {
        40
    }
    pub fn heartbeat_min_ms() -> u64 {
        5_000
    }
    pub fn heartbeat_max_ms() -> u64 {
        300_000
    }
    pub fn heartbeat_initial_ms() -> u64 {
        30_000
    }
    pub fn heartbeat_inactive_ticks() -> u32 {
        10
    }
    pub fn max_records() -> usize {
        500
    }
    pub fn max_chars() -> usize {
        200_000
    }
    pub fn min_age_days() -> i64 {
        7
    }
    pub fn compaction_truncate_chars() -> usize {
        4_000
    }
    pub fn long_memory_cap_blocks() -> usize {
        200
    }
    pub fn entropy_min_len() -> usize {
        28
    }
    pub fn entropy_min_bits() -> f64 {
        4.0
    }
    pub fn scheduler_poll_secs() -> u64 {
        5
    }
    pub fn scheduler_retries() -> u32 {
        2
    }
    pub fn provider_backoff_ms() -> u64 {
        200
    }
    pub fn provider_retries() -> u32 {
        2
    }
    pub fn max_concurrent_runs() -> u32 {
        4
    }
    pub fn exec_timeout_secs() -> u64 {
        15
    }
    pub fn exec_max_buffer_bytes() -> usize {
        64 * 1024
    }
    pub fn fetch_max_body_bytes() -> usize {
        20 * 1024
    }
    pub fn fetch_max_redirects() -> u8 {
        5
    }
    pub fn budget_per_hour() -> usize {
        20
    }
    pub fn budget_per_day() -> usize {
        100
    }
    pub fn replay_count() -> usize {
        10
    }
    pub fn replay_since_hours() -> i64 {
        24
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates_in_dev_mode() {
        let config = Config {
            dev_mode: true,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn placeholder_model_rejected_outside_dev_mode() {
        let config = Config {
            models: ModelsConfig {
                default_model: "changeme".to_string(),
                ..ModelsConfig::default()
            },
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_with_unrecognized_out_of_scope_groups() {
        let toml_src = r#"
            workspace_dir = "/tmp/ws"
            dev_mode = true

            [gateway]
            port = 8080

            [mcp]
            enabled = true
        "#;
        let config: Config = toml::from_str(toml_src).expect("unrecognized tables are ignored");
        assert_eq!(config.workspace_dir, std::path::PathBuf::from("/tmp/ws"));
    }
}
