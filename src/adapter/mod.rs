//! `ModelAdapter`: a provider-agnostic streaming chat interface with
//! fallback-chain composition across providers. Each concrete provider
//! (subprocess CLI, HTTP streaming, synthetic) normalizes its own wire
//! format into the shared `AdapterEvent` stream.

pub mod events;
pub mod http;
pub mod subprocess;
pub mod synthetic;
pub mod types;

pub use events::{AdapterEvent, EventCollector};
pub use types::{ContentBlock, MessageRole, ProviderCapabilities, ProviderMessage, ProviderResponse, StopReason};

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::error::{CoreError, Result};

pub type EventStream = BoxStream<'static, AdapterEvent>;

#[async_trait::async_trait]
pub trait ModelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Stream a chat turn. `turn_id` lets the caller later `cancel` this
    /// exact in-flight call.
    async fn chat_stream(&self, turn_id: Uuid, messages: &[ProviderMessage]) -> Result<EventStream>;

    /// Cancel an in-flight call by turn id. A no-op if the call already
    /// finished or was never started on this adapter.
    async fn cancel(&self, turn_id: Uuid);

    /// A cheap liveness probe used to decide whether this provider
    /// belongs in the validated-fallback set.
    async fn warmup(&self) -> Result<()>;
}

/// Errors that justify moving to the next adapter in a fallback chain.
/// A semantic/business error (e.g. a tool the model invoked was denied)
/// must NOT trigger fallback — only transport/auth-shaped failures do.
fn is_fallback_eligible(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::AdapterTransport(_) | CoreError::AdapterTimeout(_) | CoreError::AuthMissing(_) | CoreError::AuthInvalid(_)
    )
}

/// Composes an ordered list of adapters: tries the first, and on a
/// fallback-eligible error tries the next, until one succeeds or the
/// chain is exhausted.
pub struct FallbackChain {
    adapters: Vec<Arc<dyn ModelAdapter>>,
}

impl FallbackChain {
    pub fn new(adapters: Vec<Arc<dyn ModelAdapter>>) -> Self {
        Self { adapters }
    }

    pub async fn chat_stream(&self, turn_id: Uuid, messages: &[ProviderMessage]) -> Result<(EventStream, String)> {
        let mut last_err = None;
        for adapter in &self.adapters {
            match adapter.chat_stream(turn_id, messages).await {
                Ok(stream) => return Ok((stream, adapter.name().to_string())),
                Err(err) if is_fallback_eligible(&err) => {
                    last_err = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::AdapterTransport("no adapters configured".to_string())))
    }

    /// Only adapters that currently pass `warmup()` within `timeout` are
    /// considered validated; used when `use_only_validated_fallbacks` is
    /// set so a dead provider never gets tried mid-turn.
    pub async fn validated(&self, timeout: Duration) -> Vec<Arc<dyn ModelAdapter>> {
        let mut validated = Vec::new();
        for adapter in &self.adapters {
            if tokio::time::timeout(timeout, adapter.warmup()).await.map(|r| r.is_ok()).unwrap_or(false) {
                validated.push(adapter.clone());
            }
        }
        validated
    }

    pub async fn cancel_all(&self, turn_id: Uuid) {
        for adapter in &self.adapters {
            adapter.cancel(turn_id).await;
        }
    }
}
