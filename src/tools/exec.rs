//! `exec`: runs a command with its arguments tokenized up front (never
//! through a shell), under a timeout and output-buffer cap. Destructive
//! signatures are hard-denied before anything else runs; everything else
//! (allow-list membership, intent) is gated by approval rather than a
//! hard denial, so an operator can still authorize an unlisted or
//! mutating command.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use crate::error::{CoreError, Result};
use crate::tools::{exec_required_capabilities, intent_label, Tool, ToolIntent, ToolOutcome};

const DESTRUCTIVE_SIGNATURES: &[&[&str]] = &[
    &["rm", "-rf"],
    &["rm", "-fr"],
    &["dd", "if="],
    &["mkfs"],
];

const MUTATING_VERBS: &[&str] = &["rm", "mv", "cp", "sed", "truncate", "tee"];
const NETWORK_VERBS: &[&str] = &["curl", "wget", "scp", "ssh", "nc", "nmap"];
const PRIVILEGE_VERBS: &[&str] = &["sudo", "chmod", "chown", "mount", "passwd", "useradd"];

#[derive(Debug, Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

pub struct ExecTool {
    pub allowed_commands: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub timeout: Duration,
    pub max_buffer_bytes: usize,
}

impl ExecTool {
    fn parse(args: &Value) -> Result<ExecArgs> {
        serde_json::from_value(args.clone()).map_err(|e| CoreError::ToolSchemaInvalid(e.to_string()))
    }

    /// Keyword-scan intent classification per the rule table: mutating
    /// verbs first, then network verbs, then privilege verbs, else
    /// read-only. `sed -i` is the only mutating form of `sed` (a bare
    /// `sed` read is not mutating), so it's matched on the full token
    /// list rather than the verb alone.
    fn classify(command: &str, args: &[String]) -> ToolIntent {
        if command == "sed" {
            if args.iter().any(|a| a == "-i" || a.starts_with("-i")) {
                return ToolIntent::Mutating;
            }
        } else if MUTATING_VERBS.contains(&command) {
            return ToolIntent::Mutating;
        }
        if NETWORK_VERBS.contains(&command) {
            return ToolIntent::NetworkImpacting;
        }
        if PRIVILEGE_VERBS.contains(&command) {
            return ToolIntent::PrivilegeImpacting;
        }
        ToolIntent::ReadOnly
    }

    fn matches_destructive_signature(command: &str, args: &[String]) -> Option<String> {
        let full: Vec<&str> = std::iter::once(command)
            .chain(args.iter().map(|s| s.as_str()))
            .collect();

        for signature in DESTRUCTIVE_SIGNATURES {
            if full.len() >= signature.len()
                && full
                    .iter()
                    .zip(signature.iter())
                    .all(|(a, b)| a.starts_with(b) || a == b)
            {
                return Some(format!("matches destructive signature: {}", signature.join(" ")));
            }
        }
        if args.iter().any(|a| a.starts_with(">/dev/")) {
            return Some("redirect into /dev device node".to_string());
        }
        None
    }

    fn touches_forbidden_path(&self, args: &[String]) -> bool {
        args.iter()
            .any(|a| self.forbidden_paths.iter().any(|forbidden| a.starts_with(forbidden.as_str())))
    }

    fn is_allow_listed(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|c| c == command)
    }
}

fn schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "minLength": 1 },
                "args": { "type": "array", "items": { "type": "string" } },
            },
            "required": ["command"],
        })
    })
}

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn json_schema(&self) -> &Value {
        schema()
    }

    fn classify_intent(&self, args: &Value) -> ToolIntent {
        match Self::parse(args) {
            Ok(parsed) => Self::classify(&parsed.command, &parsed.args),
            Err(_) => ToolIntent::ReadOnly,
        }
    }

    fn is_hard_denied(&self, args: &Value) -> Option<String> {
        let parsed = Self::parse(args).ok()?;
        if let Some(reason) = Self::matches_destructive_signature(&parsed.command, &parsed.args) {
            return Some(reason);
        }
        if self.touches_forbidden_path(&parsed.args) {
            return Some("argument touches a forbidden path".to_string());
        }
        None
    }

    /// Two independent gates, per the rule table's resolution for a
    /// command that is both allow-listed and non-read-intent: neither
    /// check is allowed to wave the other through. Gate one fires when
    /// the command isn't on the allow-list; gate two fires whenever the
    /// classified intent isn't read-only, even for an allow-listed
    /// command.
    fn approval_gates(&self, args: &Value) -> Vec<(String, Vec<String>)> {
        let Ok(parsed) = Self::parse(args) else {
            return Vec::new();
        };
        let mut gates = Vec::new();
        if !self.is_allow_listed(&parsed.command) {
            gates.push(("unlisted-command".to_string(), vec!["process.exec".to_string()]));
        }
        let intent = Self::classify(&parsed.command, &parsed.args);
        if intent != ToolIntent::ReadOnly {
            gates.push((intent_label(intent).to_string(), exec_required_capabilities(intent)));
        }
        gates
    }

    async fn execute(&self, args: &Value) -> Result<ToolOutcome> {
        let parsed = Self::parse(args)?;
        run_bounded(&parsed.command, &parsed.args, self.timeout, self.max_buffer_bytes).await
    }
}

async fn run_bounded(command: &str, args: &[String], timeout: Duration, max_buffer: usize) -> Result<ToolOutcome> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CoreError::ToolExecDenied(format!("failed to spawn {command}: {e}")))?;

    let wait_with_output = child.wait_with_output();
    let result = tokio::time::timeout(timeout, wait_with_output).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(CoreError::ToolExecDenied(format!("exec failed: {e}"))),
        Err(_) => {
            return Err(CoreError::AdapterTimeout(format!(
                "{command} exceeded {}s timeout",
                timeout.as_secs()
            )));
        }
    };

    let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let mut truncated = false;

    if stdout.len() > max_buffer {
        stdout.truncate(max_buffer);
        truncated = true;
    }
    if stderr.len() > max_buffer {
        stderr.truncate(max_buffer);
        truncated = true;
    }

    Ok(ToolOutcome {
        output: serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code(),
        }),
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ExecTool {
        ExecTool {
            allowed_commands: vec!["echo".into(), "rm".into()],
            forbidden_paths: vec!["/etc".into()],
            timeout: Duration::from_secs(5),
            max_buffer_bytes: 4096,
        }
    }

    #[test]
    fn rm_rf_is_hard_denied_even_if_allow_listed() {
        let tool = tool();
        let args = serde_json::json!({"command": "rm", "args": ["-rf", "/tmp/x"]});
        assert!(tool.is_hard_denied(&args).is_some());
    }

    #[test]
    fn dev_redirect_is_hard_denied() {
        let tool = tool();
        let args = serde_json::json!({"command": "echo", "args": ["hi", ">/dev/sda"]});
        assert!(tool.is_hard_denied(&args).is_some());
    }

    #[test]
    fn forbidden_path_argument_is_denied() {
        let tool = tool();
        let args = serde_json::json!({"command": "echo", "args": ["/etc/passwd"]});
        assert!(tool.is_hard_denied(&args).is_some());
    }

    #[test]
    fn benign_allow_listed_call_is_not_denied() {
        let tool = tool();
        let args = serde_json::json!({"command": "echo", "args": ["hello"]});
        assert!(tool.is_hard_denied(&args).is_none());
    }

    #[test]
    fn classify_intent_covers_all_four_categories() {
        let tool = tool();
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "echo", "args": ["hi"]})),
            ToolIntent::ReadOnly
        );
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "rm", "args": ["/tmp/a"]})),
            ToolIntent::Mutating
        );
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "curl", "args": ["https://example.com"]})),
            ToolIntent::NetworkImpacting
        );
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "chmod", "args": ["+x", "a.sh"]})),
            ToolIntent::PrivilegeImpacting
        );
    }

    #[test]
    fn sed_in_place_is_mutating_but_plain_sed_is_read_only() {
        let tool = tool();
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "sed", "args": ["-i", "s/a/b/", "f"]})),
            ToolIntent::Mutating
        );
        assert_eq!(
            tool.classify_intent(&serde_json::json!({"command": "sed", "args": ["s/a/b/", "f"]})),
            ToolIntent::ReadOnly
        );
    }

    #[test]
    fn unlisted_command_gets_an_approval_gate_instead_of_a_hard_denial() {
        let tool = tool();
        let args = serde_json::json!({"command": "curl", "args": ["https://example.com"]});
        assert!(tool.is_hard_denied(&args).is_none());
        let gates = tool.approval_gates(&args);
        assert!(gates.iter().any(|(label, _)| label == "unlisted-command"));
    }

    #[test]
    fn allow_listed_mutating_command_still_gets_an_intent_gate() {
        let tool = tool();
        let args = serde_json::json!({"command": "rm", "args": ["/tmp/a"]});
        let gates = tool.approval_gates(&args);
        assert!(!gates.iter().any(|(label, _)| label == "unlisted-command"));
        assert!(gates.iter().any(|(label, _)| label == "mutating"));
    }

    #[test]
    fn allow_listed_read_only_command_has_no_gates() {
        let tool = tool();
        let args = serde_json::json!({"command": "echo", "args": ["hi"]});
        assert!(tool.approval_gates(&args).is_empty());
    }

    #[test]
    fn unlisted_mutating_command_gets_both_gates() {
        let tool = ExecTool {
            allowed_commands: vec!["echo".into()],
            ..tool()
        };
        let args = serde_json::json!({"command": "mv", "args": ["/tmp/a", "/tmp/b"]});
        let gates = tool.approval_gates(&args);
        assert_eq!(gates.len(), 2);
    }
}
