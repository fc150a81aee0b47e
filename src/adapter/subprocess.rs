//! `cursor-agent-cli` style provider: spawns a configured command,
//! optionally writes the prompt to its stdin, and streams line-delimited
//! JSON frames off its stdout. Each line must parse as `{type, data}`; a
//! malformed frame fails the turn fast rather than letting the model see
//! a half-decoded event. A `tool_call` whose name isn't in the known
//! tool list also fails fast, since a model hallucinating a tool name is
//! as dangerous as the router executing one it never registered.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::adapter::events::AdapterEvent;
use crate::adapter::types::{ContentBlock, MessageRole, ProviderCapabilities, ProviderMessage};
use crate::adapter::{EventStream, ModelAdapter};
use crate::error::{CoreError, Result};

pub struct SubprocessConfig {
    pub command: String,
    pub args: Vec<String>,
    /// When `true`, the rendered prompt is appended as a final argument
    /// instead of being written to stdin.
    pub prompt_as_arg: bool,
    /// Tool names the model is permitted to call; an unknown name in a
    /// `tool_call` frame fails the turn.
    pub known_tool_names: Vec<String>,
    pub startup_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

pub struct SubprocessAdapter {
    name: String,
    config: SubprocessConfig,
    children: AsyncMutex<HashMap<Uuid, Arc<AsyncMutex<Child>>>>,
}

impl SubprocessAdapter {
    pub fn new(name: impl Into<String>, config: SubprocessConfig) -> Self {
        Self {
            name: name.into(),
            config,
            children: AsyncMutex::new(HashMap::new()),
        }
    }

    fn render_prompt(messages: &[ProviderMessage]) -> String {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                };
                let text: String = m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        ContentBlock::ToolResult { content, .. } => tool_result_text(content),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("[{role}] {text}")
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Tool result content is only forwarded into the rendered prompt when
/// it's already a plain string; structured results are dropped here
/// rather than serialized inline.
fn tool_result_text(content: &Value) -> Option<&str> {
    content.as_str()
}

#[async_trait::async_trait]
impl ModelAdapter for SubprocessAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_tools: true,
            supports_streaming: true,
        }
    }

    async fn chat_stream(&self, turn_id: Uuid, messages: &[ProviderMessage]) -> Result<EventStream> {
        let prompt = Self::render_prompt(messages);

        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if self.config.prompt_as_arg { Stdio::null() } else { Stdio::piped() });
        if self.config.prompt_as_arg {
            command.arg(&prompt);
        }

        let mut child = command
            .spawn()
            .map_err(|e| CoreError::AdapterTransport(format!("failed to spawn {}: {e}", self.config.command)))?;

        if !self.config.prompt_as_arg {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|e| CoreError::AdapterTransport(format!("writing prompt to stdin: {e}")))?;
                drop(stdin);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::AdapterTransport("child stdout not captured".to_string()))?;

        let shared_child = Arc::new(AsyncMutex::new(child));
        self.children.lock().await.insert(turn_id, shared_child.clone());

        let known = self.config.known_tool_names.clone();
        let reader = BufReader::new(stdout);

        let out_stream = stream! {
            let mut lines = reader.lines();
            let mut tool_call_index: u32 = 0;

            loop {
                let next = lines.next_line().await;
                match next {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let frame: Frame = match serde_json::from_str(&line) {
                            Ok(frame) => frame,
                            Err(e) => {
                                yield AdapterEvent::Error {
                                    message: format!("malformed frame: {e}"),
                                };
                                break;
                            }
                        };

                        match frame.kind.as_str() {
                            "assistant_delta" => {
                                let text = frame.data.get("text").and_then(Value::as_str).unwrap_or_default();
                                yield AdapterEvent::TextDelta { text: text.to_string() };
                            }
                            "tool_call" => {
                                let name = frame.data.get("name").and_then(Value::as_str).unwrap_or_default();
                                if !known.is_empty() && !known.iter().any(|n| n == name) {
                                    yield AdapterEvent::Error {
                                        message: format!("unknown tool in tool_call: {name}"),
                                    };
                                    break;
                                }
                                let args = frame.data.get("args").cloned().unwrap_or(Value::Null);
                                let id = frame
                                    .data
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                                    .unwrap_or_else(|| format!("call_{tool_call_index}"));
                                yield AdapterEvent::ToolCallDelta {
                                    index: tool_call_index,
                                    id: Some(id),
                                    name: Some(name.to_string()),
                                    args_fragment: Some(serde_json::to_string(&args).unwrap_or_default()),
                                };
                                yield AdapterEvent::ToolCallComplete { index: tool_call_index };
                                tool_call_index += 1;
                            }
                            "usage" => {
                                let input_tokens = frame.data.get("input_tokens").and_then(Value::as_u64);
                                let output_tokens = frame.data.get("output_tokens").and_then(Value::as_u64);
                                yield AdapterEvent::Usage { input_tokens, output_tokens };
                            }
                            "done" => {
                                yield AdapterEvent::Done { stop_reason: crate::adapter::types::StopReason::EndTurn };
                                break;
                            }
                            "error" => {
                                let message = frame.data.get("message").and_then(Value::as_str).unwrap_or("provider error").to_string();
                                yield AdapterEvent::Error { message };
                                break;
                            }
                            other => {
                                yield AdapterEvent::Error {
                                    message: format!("malformed frame: unknown type {other}"),
                                };
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        yield AdapterEvent::Done { stop_reason: crate::adapter::types::StopReason::EndTurn };
                        break;
                    }
                    Err(e) => {
                        yield AdapterEvent::Error { message: format!("stdout read failed: {e}") };
                        break;
                    }
                }
            }

            let mut guard = shared_child.lock().await;
            let _ = guard.wait().await;
        };

        Ok(Box::pin(out_stream))
    }

    /// Release the child for `turn_id`: `SIGTERM`, then `SIGKILL` if it
    /// hasn't exited within 250ms. A missed signal (process already
    /// gone) is not an error — the process is considered released once
    /// `close`/`wait` returns.
    async fn cancel(&self, turn_id: Uuid) {
        let child = { self.children.lock().await.remove(&turn_id) };
        let Some(child) = child else { return };
        let mut guard = child.lock().await;
        if let Some(pid) = guard.id() {
            unsafe {
                libc_kill(pid as i32, 15);
            }
        }
        let terminated = tokio::time::timeout(Duration::from_millis(250), guard.wait()).await;
        if terminated.is_err() {
            let _ = guard.start_kill();
            let _ = guard.wait().await;
        }
    }

    async fn warmup(&self) -> Result<()> {
        let output = tokio::time::timeout(
            self.config.startup_timeout,
            Command::new(&self.config.command).arg("--version").output(),
        )
        .await;
        match output {
            Ok(Ok(out)) if out.status.success() => Ok(()),
            Ok(Ok(out)) => Err(CoreError::AdapterTransport(format!(
                "{} --version exited with {}",
                self.config.command, out.status
            ))),
            Ok(Err(e)) => Err(CoreError::AdapterTransport(e.to_string())),
            Err(_) => Err(CoreError::AdapterTimeout(format!("{} warmup timed out", self.config.command))),
        }
    }
}

/// Minimal `SIGTERM` send without pulling in a full signals crate: the
/// subprocess is always our own child, so a raw `kill(2)` is safe and
/// avoids a platform-specific dependency for one syscall.
unsafe fn libc_kill(pid: i32, sig: i32) {
    #[cfg(unix)]
    unsafe {
        extern "C" {
            fn kill(pid: i32, sig: i32) -> i32;
        }
        let _ = kill(pid, sig);
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str, args: &[&str]) -> SubprocessConfig {
        SubprocessConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            prompt_as_arg: false,
            known_tool_names: vec!["exec".to_string()],
            startup_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn streams_assistant_delta_and_done_frames() {
        let script = r#"printf '{"type":"assistant_delta","data":{"text":"hi"}}\n{"type":"done","data":{}}\n'"#;
        let adapter = SubprocessAdapter::new("test", config("sh", &["-c", script]));
        let messages = vec![ProviderMessage::text(MessageRole::User, "hello")];

        use futures_util::StreamExt;
        let mut stream = adapter.chat_stream(Uuid::new_v4(), &messages).await.unwrap();
        let mut collector = crate::adapter::events::EventCollector::new();
        while let Some(event) = stream.next().await {
            collector.feed(event);
        }
        let response = collector.finish();
        assert_eq!(response.text(), "hi");
    }

    #[tokio::test]
    async fn malformed_frame_emits_error_event() {
        let script = r#"printf 'not-json\n'"#;
        let adapter = SubprocessAdapter::new("test", config("sh", &["-c", script]));
        let messages = vec![ProviderMessage::text(MessageRole::User, "hello")];

        use futures_util::StreamExt;
        let mut stream = adapter.chat_stream(Uuid::new_v4(), &messages).await.unwrap();
        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            if matches!(event, AdapterEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn unknown_tool_call_name_fails_fast() {
        let script = r#"printf '{"type":"tool_call","data":{"name":"not_registered","args":{}}}\n'"#;
        let adapter = SubprocessAdapter::new("test", config("sh", &["-c", script]));
        let messages = vec![ProviderMessage::text(MessageRole::User, "hello")];

        use futures_util::StreamExt;
        let mut stream = adapter.chat_stream(Uuid::new_v4(), &messages).await.unwrap();
        let mut saw_error = false;
        while let Some(event) = stream.next().await {
            if let AdapterEvent::Error { message } = event {
                saw_error = true;
                assert!(message.contains("unknown tool"));
            }
        }
        assert!(saw_error);
    }
}
