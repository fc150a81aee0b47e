//! Streaming event shape every provider normalizes into, and the
//! collector that accumulates index-keyed tool-call deltas into
//! complete tool calls.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::adapter::types::{ProviderResponse, StopReason};

#[derive(Debug, Clone)]
pub enum AdapterEvent {
    ResponseStart,
    TextDelta { text: String },
    ToolCallDelta { index: u32, id: Option<String>, name: Option<String>, args_fragment: Option<String> },
    ToolCallComplete { index: u32 },
    Usage { input_tokens: Option<u64>, output_tokens: Option<u64> },
    Done { stop_reason: StopReason },
    Error { message: String },
}

#[derive(Default, Debug, Clone)]
struct PartialToolCall {
    id: String,
    name: String,
    args_buffer: String,
}

/// Accumulates a provider's streamed deltas into a finished
/// `ProviderResponse`. Tool call fragments arrive keyed by index (a
/// provider may interleave deltas for several tool calls at once), so
/// the buffer is index-keyed rather than append-only.
#[derive(Default)]
pub struct EventCollector {
    text: String,
    tool_calls: BTreeMap<u32, PartialToolCall>,
    stop_reason: Option<StopReason>,
    error: Option<String>,
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::ResponseStart => {}
            AdapterEvent::TextDelta { text } => self.text.push_str(&text),
            AdapterEvent::ToolCallDelta {
                index,
                id,
                name,
                args_fragment,
            } => {
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = id {
                    entry.id = id;
                }
                if let Some(name) = name {
                    entry.name = name;
                }
                if let Some(fragment) = args_fragment {
                    entry.args_buffer.push_str(&fragment);
                }
            }
            AdapterEvent::ToolCallComplete { .. } => {}
            AdapterEvent::Usage { input_tokens, output_tokens } => {
                self.input_tokens = input_tokens.or(self.input_tokens);
                self.output_tokens = output_tokens.or(self.output_tokens);
            }
            AdapterEvent::Done { stop_reason } => self.stop_reason = Some(stop_reason),
            AdapterEvent::Error { message } => self.error = Some(message),
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn usage(&self) -> (Option<u64>, Option<u64>) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn finish(self) -> ProviderResponse {
        use crate::adapter::types::ContentBlock;

        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text { text: self.text });
        }
        for (_, call) in self.tool_calls {
            let args: Value = serde_json::from_str(&call.args_buffer).unwrap_or(Value::Null);
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                args,
            });
        }

        let stop_reason = self.stop_reason.unwrap_or(StopReason::EndTurn);
        ProviderResponse {
            content,
            stop_reason,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        }
    }
}
