//! The terminal element of a fallback chain: a deterministic,
//! non-networked provider that always succeeds so a turn can still
//! produce a response when every real provider is exhausted.

use futures_util::stream;
use uuid::Uuid;

use crate::adapter::events::AdapterEvent;
use crate::adapter::types::{MessageRole, ProviderCapabilities, ProviderMessage, StopReason};
use crate::adapter::{EventStream, ModelAdapter};
use crate::error::Result;

/// Echoes the most recent user message back, prefixed with a fixed
/// marker so callers can tell a synthetic response from a real one.
pub struct SyntheticAdapter {
    name: String,
}

impl SyntheticAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for SyntheticAdapter {
    fn default() -> Self {
        Self::new("fallback-synthetic")
    }
}

fn last_user_text(messages: &[ProviderMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| {
            m.content
                .iter()
                .filter_map(|block| match block {
                    crate::adapter::types::ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ModelAdapter for SyntheticAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            supports_tools: false,
            supports_streaming: true,
        }
    }

    async fn chat_stream(&self, _turn_id: Uuid, messages: &[ProviderMessage]) -> Result<EventStream> {
        let echoed = last_user_text(messages);
        let text = if echoed.is_empty() {
            "[synthetic fallback: no prior provider was reachable]".to_string()
        } else {
            format!("[synthetic fallback] acknowledged: {echoed}")
        };

        let events = vec![
            AdapterEvent::ResponseStart,
            AdapterEvent::TextDelta { text },
            AdapterEvent::Done { stop_reason: StopReason::EndTurn },
        ];
        Ok(Box::pin(stream::iter(events)))
    }

    /// The synthetic provider has nothing in flight to cancel.
    async fn cancel(&self, _turn_id: Uuid) {}

    /// Always reachable — it does no I/O.
    async fn warmup(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::events::EventCollector;

    #[tokio::test]
    async fn echoes_the_last_user_message() {
        let adapter = SyntheticAdapter::default();
        let messages = vec![ProviderMessage::text(MessageRole::User, "ping")];
        let mut stream = adapter.chat_stream(Uuid::new_v4(), &messages).await.unwrap();

        let mut collector = EventCollector::new();
        use futures_util::StreamExt;
        while let Some(event) = stream.next().await {
            collector.feed(event);
        }
        let response = collector.finish();
        assert!(response.text().contains("ping"));
        assert_eq!(response.stop_reason, StopReason::EndTurn);
    }

    #[tokio::test]
    async fn warmup_never_fails() {
        let adapter = SyntheticAdapter::default();
        assert!(adapter.warmup().await.is_ok());
    }
}
