//! `ToolRouter`: the single place a tool call passes through before it
//! touches the outside world. Runs the isolation-mode policy check,
//! schema validation, intent classification, capability/approval gating
//! (escalating to an approval request when a grant is missing),
//! destructive-signature hard denial, execution, and an output-scrub/
//! truncation pass around the result.

pub mod exec;
pub mod web_fetch;

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::approval::ApprovalWorkflow;
use crate::capability::CapabilityStore;
use crate::error::{CoreError, Result};
use crate::journal::DecisionJournal;
use crate::privacy::PrivacyScrubber;

use std::sync::Arc;

/// Classification of what an `exec` invocation does to the system, per
/// the rule table in the capability design. Other tools map onto
/// `ReadOnly` unless they declare themselves otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolIntent {
    ReadOnly,
    NetworkImpacting,
    Mutating,
    PrivilegeImpacting,
}

pub fn intent_label(intent: ToolIntent) -> &'static str {
    match intent {
        ToolIntent::ReadOnly => "read-only",
        ToolIntent::NetworkImpacting => "network-impacting",
        ToolIntent::Mutating => "mutating",
        ToolIntent::PrivilegeImpacting => "privilege-impacting",
    }
}

/// Capabilities required for an `exec` call of the given intent, per the
/// rule table: read-only needs nothing; every other intent needs
/// `process.exec` plus an intent-specific capability.
pub fn exec_required_capabilities(intent: ToolIntent) -> Vec<String> {
    match intent {
        ToolIntent::ReadOnly => Vec::new(),
        ToolIntent::NetworkImpacting => vec!["process.exec".to_string(), "net.fetch".to_string()],
        ToolIntent::Mutating => vec![
            "process.exec".to_string(),
            "fs.write".to_string(),
            "process.exec.mutate".to_string(),
        ],
        ToolIntent::PrivilegeImpacting => vec!["process.exec".to_string(), "process.exec.privileged".to_string()],
    }
}

/// Whether a tool is subject to the generic `tool.high-risk` gate. `exec`
/// and `web_fetch` have their own dedicated rule-table rows instead and
/// report `Normal` here even though they're dangerous in their own right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
    pub provenance: String,
    pub untrusted: bool,
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub output: Value,
    pub truncated: bool,
}

#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    /// `High` routes this tool through the generic `tool.high-risk` gate
    /// and makes it deniable outright when tool isolation mode is active.
    fn risk_level(&self) -> RiskLevel {
        RiskLevel::Normal
    }

    /// JSON Schema the call's `args` must satisfy. Compiled once per
    /// `(tool name, schema hash)` and cached by the router.
    fn json_schema(&self) -> &Value;

    fn classify_intent(&self, args: &Value) -> ToolIntent;

    /// `true` if this specific call must be hard-denied regardless of
    /// any grant or approval (e.g. a destructive shell signature).
    fn is_hard_denied(&self, args: &Value) -> Option<String>;

    /// Ordered list of approval gates this call must clear, each a
    /// `(intent label, required capabilities)` pair. A call blocks at the
    /// first ungranted gate without evaluating later gates, so one gate
    /// being satisfied never silently satisfies another (the resolution
    /// for the "allow-listed but non-read-intent" case: two independent
    /// asks, neither bypassed by the other).
    ///
    /// Default: a single gate derived from `risk_level` — `tool.high-risk`
    /// for high-risk tools, no gate at all otherwise. `exec` and
    /// `web_fetch` override this with their own rule-table rows.
    fn approval_gates(&self, _args: &Value) -> Vec<(String, Vec<String>)> {
        match self.risk_level() {
            RiskLevel::High => vec![("high-risk-tool".to_string(), vec!["tool.high-risk".to_string()])],
            RiskLevel::Normal => Vec::new(),
        }
    }

    async fn execute(&self, args: &Value) -> Result<ToolOutcome>;
}

pub struct ToolRouterConfig {
    pub max_output_bytes: usize,
    pub grant_ttl: ChronoDuration,
    /// When active, any high-risk tool call is denied outright
    /// (`TOOL_POLICY_BLOCKED`) rather than gated by approval — used when
    /// the turn is running a model/session that hasn't been vetted for
    /// trusted tool use.
    pub isolation_mode_active: bool,
}

impl Default for ToolRouterConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 64 * 1024,
            grant_ttl: ChronoDuration::minutes(30),
            isolation_mode_active: false,
        }
    }
}

/// Cache key for a compiled schema validator: the tool name plus a
/// content hash of its schema, so a tool that changes its schema across
/// versions doesn't reuse a stale compiled validator.
fn schema_cache_key(name: &str, schema: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schema.to_string().as_bytes());
    format!("{name}:{}", hex::encode(hasher.finalize()))
}

pub struct ToolRouter {
    tools: Vec<Arc<dyn Tool>>,
    capabilities: Arc<CapabilityStore>,
    approvals: Arc<ApprovalWorkflow>,
    scrubber: Arc<PrivacyScrubber>,
    journal: Arc<DecisionJournal>,
    config: ToolRouterConfig,
    schema_cache: Mutex<HashMap<String, Arc<jsonschema::Validator>>>,
}

impl ToolRouter {
    pub fn new(
        capabilities: Arc<CapabilityStore>,
        approvals: Arc<ApprovalWorkflow>,
        scrubber: Arc<PrivacyScrubber>,
        journal: Arc<DecisionJournal>,
        config: ToolRouterConfig,
    ) -> Self {
        Self {
            tools: Vec::new(),
            capabilities,
            approvals,
            scrubber,
            journal,
            config,
            schema_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    fn lookup(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Validates `args` against `tool`'s schema, compiling and caching the
    /// validator by `(name, schema-hash)` on first use. A schema that
    /// fails to compile is a configuration bug in the tool, not a caller
    /// error, so it's treated as a pass-through rather than blocking every
    /// call to that tool (mirrors the graceful-skip behavior used
    /// elsewhere in the corpus for uncompilable schemas).
    fn validate_schema(&self, tool: &Arc<dyn Tool>, args: &Value) -> Result<()> {
        let schema = tool.json_schema();
        let key = schema_cache_key(tool.name(), schema);

        let validator = {
            let mut cache = self.schema_cache.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(validator) = cache.get(&key) {
                validator.clone()
            } else {
                match jsonschema::validator_for(schema) {
                    Ok(validator) => {
                        let validator = Arc::new(validator);
                        cache.insert(key, validator.clone());
                        validator
                    }
                    Err(_) => return Ok(()),
                }
            }
        };

        let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ToolSchemaInvalid(errors.join("; ")))
        }
    }

    /// Run a tool call through the full middleware chain. On success the
    /// output has been passed through the privacy scrubber; every
    /// outcome (success, policy block, approval request) is recorded to
    /// the decision journal.
    pub async fn execute(&self, call: ToolCall, scope_id: &str) -> Result<ToolOutcome> {
        let tool = self
            .lookup(&call.tool)
            .ok_or_else(|| CoreError::ToolUnknown(call.tool.clone()))?
            .clone();

        if self.config.isolation_mode_active && tool.risk_level() == RiskLevel::High {
            let reason = format!("{} is high-risk and tool isolation mode is active", call.tool);
            self.journal.record_tool_denied(&call.tool, &reason);
            return Err(CoreError::ToolPolicyBlocked(reason));
        }

        self.validate_schema(&tool, &call.args)?;

        if let Some(reason) = tool.is_hard_denied(&call.args) {
            self.journal.record_tool_denied(&call.tool, &reason);
            return Err(CoreError::ToolExecDenied(reason));
        }

        for (gate_intent, required) in tool.approval_gates(&call.args) {
            if required.is_empty() {
                continue;
            }
            let scope_key = ApprovalWorkflow::scope_key(&call.tool, &gate_intent, call.untrusted);
            let consumed = self.capabilities.consume_required(&scope_key, &required, chrono::Utc::now());

            if consumed.is_none() {
                let outcome = self.approvals.request(
                    &call.tool,
                    &gate_intent,
                    &plan_summary(&call.args),
                    required,
                    &call.provenance,
                    call.untrusted,
                );
                self.journal
                    .record_approval_requested(&call.tool, outcome.request.id, outcome.deduplicated);
                return Err(CoreError::ToolApprovalRequired(outcome.request.id.to_string()));
            }
        }

        let outcome = match tool.execute(&call.args).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.journal.record_tool_denied(&call.tool, &err.to_string());
                return Err(err);
            }
        };
        let scrubbed_text = self.scrubber.scrub_unknown(&outcome.output, scope_id)?;

        let (truncated_value, truncated) = truncate_output(scrubbed_text, self.config.max_output_bytes);

        self.journal.record_tool_executed(&call.tool, truncated);

        Ok(ToolOutcome {
            output: truncated_value,
            truncated: truncated || outcome.truncated,
        })
    }
}

fn plan_summary(args: &Value) -> String {
    serde_json::to_string(args).unwrap_or_default()
}

fn truncate_output(value: Value, max_bytes: usize) -> (Value, bool) {
    match value {
        Value::String(s) if s.len() > max_bytes => {
            let truncated: String = s.chars().take(max_bytes).collect();
            (Value::String(truncated), true)
        }
        other => (other, false),
    }
}
