//! `ollama`-style HTTP streaming provider: POSTs `/api/chat` with
//! `stream: true` and consumes newline-delimited JSON chunks off the
//! response body. Chunks may carry `tool_calls` split across an index —
//! name first, then arguments in a later chunk — so calls are
//! accumulated by index and only emitted once their arguments parse as
//! a complete JSON object or the stream reports `done: true`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapter::events::AdapterEvent;
use crate::adapter::types::{ContentBlock, MessageRole, ProviderCapabilities, ProviderMessage};
use crate::adapter::{EventStream, ModelAdapter};
use crate::error::{CoreError, Result};

pub struct HttpConfig {
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
}

pub struct HttpAdapter {
    name: String,
    config: HttpConfig,
    client: reqwest::Client,
    cancels: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl HttpAdapter {
    pub fn new(name: impl Into<String>, config: HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CoreError::AdapterTransport(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            config,
            client,
            cancels: Mutex::new(HashMap::new()),
        })
    }

    fn render_messages(messages: &[ProviderMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|m| OllamaMessage {
                role: match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::Tool => "tool",
                }
                .to_string(),
                content: m
                    .content
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.clone()),
                        ContentBlock::ToolResult { content, .. } => Some(content.to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            })
            .collect()
    }
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

#[async_trait::async_trait]
impl ModelAdapter for HttpAdapter {
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
        let request = ChatRequest {
            model: &self.config.model,
            messages: Self::render_messages(messages),
            stream: true,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.config.base_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::AdapterTransport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::AdapterTransport(format!(
                "ollama returned non-2xx status: {}",
                response.status()
            )));
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancels.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(turn_id, cancel_tx);

        let out_stream = stream! {
            let mut byte_stream = response.bytes_stream();
            let mut line_buffer = String::new();
            let mut tool_call_index: u32 = 0;
            let mut accumulated_names: HashMap<u32, String> = HashMap::new();
            let mut accumulated_args: HashMap<u32, String> = HashMap::new();
            let mut emitted: std::collections::HashSet<u32> = std::collections::HashSet::new();

            yield AdapterEvent::ResponseStart;

            'outer: loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break 'outer;
                        }
                    }
                    chunk = byte_stream.next() => {
                        let Some(chunk) = chunk else {
                            break 'outer;
                        };
                        let bytes = match chunk {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                yield AdapterEvent::Error { message: format!("stream read failed: {e}") };
                                break 'outer;
                            }
                        };
                        line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                        while let Some(pos) = line_buffer.find('\n') {
                            let line = line_buffer[..pos].trim().to_string();
                            line_buffer.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }

                            let parsed: ChatChunk = match serde_json::from_str(&line) {
                                Ok(c) => c,
                                Err(e) => {
                                    yield AdapterEvent::Error { message: format!("malformed frame: {e}") };
                                    break 'outer;
                                }
                            };

                            if let Some(msg) = &parsed.message {
                                if let Some(text) = &msg.content {
                                    if !text.is_empty() {
                                        yield AdapterEvent::TextDelta { text: text.clone() };
                                    }
                                }
                                for call in &msg.tool_calls {
                                    let Some(function) = &call.function else { continue };
                                    let idx = tool_call_index;
                                    if let Some(name) = &function.name {
                                        accumulated_names.insert(idx, name.clone());
                                    }
                                    if let Some(args) = &function.arguments {
                                        accumulated_args.insert(idx, serde_json::to_string(args).unwrap_or_default());
                                    }
                                    tool_call_index += 1;
                                }
                            }

                            if parsed.done {
                                for (idx, name) in &accumulated_names {
                                    if emitted.contains(idx) {
                                        continue;
                                    }
                                    let args_fragment = accumulated_args.get(idx).cloned();
                                    yield AdapterEvent::ToolCallDelta {
                                        index: *idx,
                                        id: Some(format!("call_{idx}")),
                                        name: Some(name.clone()),
                                        args_fragment,
                                    };
                                    yield AdapterEvent::ToolCallComplete { index: *idx };
                                }
                                yield AdapterEvent::Usage {
                                    input_tokens: parsed.prompt_eval_count,
                                    output_tokens: parsed.eval_count,
                                };
                                yield AdapterEvent::Done { stop_reason: crate::adapter::types::StopReason::EndTurn };
                                break 'outer;
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(out_stream))
    }

    async fn cancel(&self, turn_id: Uuid) {
        let tx = self.cancels.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&turn_id);
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
    }

    async fn warmup(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.config.base_url.trim_end_matches('/')))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| CoreError::AdapterTransport(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::AdapterTransport(format!("warmup returned {}", response.status())))
        }
    }
}
