//! `TurnRuntime`: the per-turn orchestrator. Assembles context from every
//! subsystem, scrubs it, drives the model adapter's tool-call loop, and
//! settles the run's lifecycle state on success or failure.

use std::sync::Arc;

use futures_util::StreamExt;
use uuid::Uuid;

use crate::adapter::{AdapterEvent, EventCollector, FallbackChain, ContentBlock, MessageRole, ProviderMessage};
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::failure::{DeepScanService, FailureLoopGuard, ReasoningResetController};
use crate::journal::{DecisionJournal, ObservationStore};
use crate::memory::{MemoryLayer, MemoryRecord, MemoryStore};
use crate::privacy::PrivacyScrubber;
use crate::run::{LifecycleEvent, LifecycleStream, RunState, RunStore};
use crate::tools::{ToolCall, ToolRouter};

/// How many consecutive reasoning resets fire before a deep scan of
/// recently-touched files gets appended to context, on top of the
/// step-back directive itself.
const DEEP_SCAN_AFTER_CONSECUTIVE_RESETS: u32 = 2;

/// Process-identity/substrate facts (current workspace, platform, time)
/// injected at the top of every turn's context. Owned by a collaborator
/// outside this crate's scope; this trait is the seam.
#[async_trait::async_trait]
pub trait SubstrateProvider: Send + Sync {
    async fn describe(&self, session_id: &str) -> Result<Option<String>>;
}

/// Opaque caller-supplied context artifacts (e.g. open documents, active
/// workspace state) folded into a turn alongside the core's own memory
/// and journal context.
#[async_trait::async_trait]
pub trait ContextProvider: Send + Sync {
    async fn artifacts(&self, session_id: &str) -> Result<Vec<String>>;
}

pub struct TurnRuntime {
    config: Arc<Config>,
    adapters: Arc<FallbackChain>,
    tool_router: Arc<ToolRouter>,
    memory: Arc<MemoryStore>,
    journal: Arc<DecisionJournal>,
    observations: Arc<ObservationStore>,
    scrubber: Arc<PrivacyScrubber>,
    runs: Arc<RunStore>,
    lifecycle: Arc<LifecycleStream>,
    failure_guard: Arc<FailureLoopGuard>,
    reasoning_reset: Arc<ReasoningResetController>,
    deep_scan: Arc<DeepScanService>,
    substrate: Option<Arc<dyn SubstrateProvider>>,
    context_providers: Vec<Arc<dyn ContextProvider>>,
}

pub struct TurnOutcome {
    pub run_id: Uuid,
    pub text: String,
}

impl TurnRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        adapters: Arc<FallbackChain>,
        tool_router: Arc<ToolRouter>,
        memory: Arc<MemoryStore>,
        journal: Arc<DecisionJournal>,
        observations: Arc<ObservationStore>,
        scrubber: Arc<PrivacyScrubber>,
        runs: Arc<RunStore>,
        lifecycle: Arc<LifecycleStream>,
        failure_guard: Arc<FailureLoopGuard>,
        reasoning_reset: Arc<ReasoningResetController>,
        deep_scan: Arc<DeepScanService>,
    ) -> Self {
        Self {
            config,
            adapters,
            tool_router,
            memory,
            journal,
            observations,
            scrubber,
            runs,
            lifecycle,
            failure_guard,
            reasoning_reset,
            deep_scan,
            substrate: None,
            context_providers: Vec::new(),
        }
    }

    pub fn with_substrate(mut self, provider: Arc<dyn SubstrateProvider>) -> Self {
        self.substrate = Some(provider);
        self
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_providers.push(provider);
        self
    }

    /// Run one turn for `session_id` given the user's `input` text.
    pub async fn run_turn(&self, session_id: &str, input: &str) -> Result<TurnOutcome> {
        let run_id = self.runs.start_run();
        self.lifecycle.emit(LifecycleEvent::RunStarted { run_id });

        let context = match self.assemble_context(session_id, input).await {
            Ok(context) => context,
            Err(err) => return self.fail(session_id, run_id, "context_assembly", &err),
        };

        let scrubbed_context = match self.scrubber.scrub_text(&context, &run_id.to_string()) {
            Ok(outcome) => outcome.text,
            Err(err) => return self.fail(session_id, run_id, "context_scrub", &CoreError::Other(err)),
        };

        self.runs.set_state(run_id, RunState::Running);
        self.lifecycle.emit(LifecycleEvent::RunStateChanged { run_id, state: RunState::Running });

        match self.drive_model_loop(session_id, run_id, &scrubbed_context, input).await {
            Ok(text) => {
                let scrubbed_final = self
                    .scrubber
                    .scrub_text(&text, &run_id.to_string())
                    .map(|o| o.text)
                    .unwrap_or(text);

                self.memory.append_event(&MemoryRecord {
                    key: format!("turn.{session_id}"),
                    value: scrubbed_final.clone(),
                    layer: MemoryLayer::Daily,
                    provenance_source_class: "assistant_turn".to_string(),
                    provenance_reference: run_id.to_string(),
                    keep_always: false,
                })?;

                self.runs.set_state(run_id, RunState::Completed);
                self.lifecycle.emit(LifecycleEvent::RunFinished { run_id, state: RunState::Completed });
                self.failure_guard.record_success(session_id);
                self.reasoning_reset.on_turn_succeeded();

                Ok(TurnOutcome { run_id, text: scrubbed_final })
            }
            Err(err) => self.fail(session_id, run_id, "model_loop", &err),
        }
    }

    fn fail(&self, session_id: &str, run_id: Uuid, stage: &str, err: &CoreError) -> Result<TurnOutcome> {
        self.failure_guard.record_failure(session_id, stage, &err.to_string());
        self.runs.set_state(run_id, RunState::Failed);
        self.lifecycle.emit(LifecycleEvent::RunFinished { run_id, state: RunState::Failed });
        Err(CoreError::Other(anyhow::anyhow!("{stage} failed: {err}")))
    }

    async fn assemble_context(&self, session_id: &str, input: &str) -> Result<String> {
        let mut sections = Vec::new();

        if let Some(substrate) = &self.substrate {
            if let Some(directive) = substrate.describe(session_id).await? {
                sections.push(format!("## substrate\n{directive}"));
            }
        }

        let memory_excerpt = self.memory.recall_scoped(input, 10)?;
        if !memory_excerpt.is_empty() {
            sections.push(format!("## memory\n{}", memory_excerpt.join("\n")));
        }

        let continuity = &self.config.continuity;
        let journal_entries = self.journal.read_entries_for_replay(
            continuity.decision_journal_replay_mode,
            continuity.replay_count,
            continuity.replay_since_hours,
        )?;
        if !journal_entries.is_empty() {
            let rendered: Vec<String> = journal_entries
                .iter()
                .map(|e| format!("- [{}] {}{}", e.kind, e.tool.clone().unwrap_or_default(), e.detail))
                .collect();
            sections.push(format!("## recent decisions\n{}", rendered.join("\n")));
        }

        let observations = self.observations.recent(10);
        if !observations.is_empty() {
            let rendered: Vec<String> = observations.iter().map(|o| format!("- [{}] {}", o.source, o.payload)).collect();
            sections.push(format!("## recent observations\n{}", rendered.join("\n")));
        }

        for provider in &self.context_providers {
            let artifacts = provider.artifacts(session_id).await?;
            sections.extend(artifacts);
        }

        if self.failure_guard.requires_step_back(session_id) {
            sections.push(
                "## step back\nThe last approach repeated the same failure. Stop, reconsider the plan, and try a different strategy before retrying."
                    .to_string(),
            );
            let reset_count = self.reasoning_reset.trigger_reset();
            if reset_count >= DEEP_SCAN_AFTER_CONSECUTIVE_RESETS {
                let report = self.deep_scan.scan_recently_touched()?;
                let listing: Vec<String> = report.files.iter().map(|f| f.path.display().to_string()).collect();
                sections.push(format!(
                    "## recently touched files{}\n{}",
                    if report.truncated { " (truncated)" } else { "" },
                    listing.join("\n")
                ));
            }
        }

        Ok(sections.join("\n\n"))
    }

    async fn drive_model_loop(&self, session_id: &str, run_id: Uuid, context: &str, input: &str) -> Result<String> {
        let mut messages = vec![
            ProviderMessage::text(MessageRole::System, context.to_string()),
            ProviderMessage::text(MessageRole::User, input.to_string()),
        ];

        let mut final_text = String::new();
        let mut message_count = 0usize;

        loop {
            message_count += 1;
            if message_count > self.config.session.max_messages_per_turn {
                return Err(CoreError::TurnBudgetExceeded(format!(
                    "session {session_id} exceeded {} messages in one turn",
                    self.config.session.max_messages_per_turn
                )));
            }

            let (mut stream, _adapter_name) = self.adapters.chat_stream(run_id, &messages).await?;
            let mut collector = EventCollector::new();
            while let Some(event) = stream.next().await {
                if let AdapterEvent::Error { message } = &event {
                    return Err(CoreError::AdapterTransport(message.clone()));
                }
                collector.feed(event);
            }

            let response = collector.finish();
            final_text.push_str(&response.text());

            let tool_calls: Vec<(String, String, serde_json::Value)> = response
                .tool_calls()
                .into_iter()
                .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
                .collect();

            if tool_calls.is_empty() {
                break;
            }

            messages.push(ProviderMessage {
                role: MessageRole::Assistant,
                content: response.content,
            });

            for (id, name, args) in tool_calls {
                let scrubbed_args = self
                    .scrubber
                    .scrub_unknown(&args, &run_id.to_string())
                    .map_err(CoreError::Other)?;

                self.observations.push(&name, &scrubbed_args.to_string());

                let call = ToolCall {
                    tool: name.clone(),
                    args: scrubbed_args,
                    provenance: session_id.to_string(),
                    untrusted: false,
                };

                let (result_value, is_error) = match self.tool_router.execute(call, &run_id.to_string()).await {
                    Ok(outcome) => (outcome.output, false),
                    Err(err) => (serde_json::Value::String(err.to_string()), true),
                };

                messages.push(ProviderMessage {
                    role: MessageRole::Tool,
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: id,
                        content: result_value,
                        is_error,
                    }],
                });
            }
        }

        Ok(final_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::synthetic::SyntheticAdapter;
    use crate::approval::ApprovalWorkflow;
    use crate::capability::CapabilityStore;
    use crate::tools::ToolRouterConfig;

    fn runtime(config: Config) -> TurnRuntime {
        let adapters = Arc::new(FallbackChain::new(vec![Arc::new(SyntheticAdapter::default())]));
        let tool_router = Arc::new(ToolRouter::new(
            Arc::new(CapabilityStore::new()),
            Arc::new(ApprovalWorkflow::new()),
            Arc::new(PrivacyScrubber::new(false)),
            Arc::new(DecisionJournal::new_in_memory()),
            ToolRouterConfig::default(),
        ));
        TurnRuntime::new(
            Arc::new(config),
            adapters,
            tool_router,
            Arc::new(MemoryStore::new(std::env::temp_dir().join(format!("turn-test-{}", Uuid::new_v4())))),
            Arc::new(DecisionJournal::new_in_memory()),
            Arc::new(ObservationStore::new(32)),
            Arc::new(PrivacyScrubber::new(false)),
            Arc::new(RunStore::new(100)),
            Arc::new(LifecycleStream::new(64)),
            Arc::new(FailureLoopGuard::new(3)),
            Arc::new(ReasoningResetController::new()),
            Arc::new(DeepScanService::new(std::env::temp_dir())),
        )
    }

    #[tokio::test]
    async fn a_turn_with_no_tool_calls_completes_and_runs_the_lifecycle_to_completed() {
        let runtime = runtime(Config { dev_mode: true, ..Config::default() });
        let outcome = runtime.run_turn("session-1", "ping").await.unwrap();
        assert!(outcome.text.contains("ping"));
        assert_eq!(runtime.runs.get(outcome.run_id).unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn a_failing_turn_records_a_failure_and_marks_the_run_failed() {
        let mut config = Config { dev_mode: true, ..Config::default() };
        config.session.max_messages_per_turn = 0;
        let runtime = runtime(config);
        let err = runtime.run_turn("session-2", "ping").await.unwrap_err();
        assert!(err.to_string().contains("model_loop"));
        assert_eq!(runtime.failure_guard.count_for("session-2"), 1);
    }

    #[tokio::test]
    async fn step_back_directive_is_injected_once_the_failure_threshold_is_reached() {
        let runtime = runtime(Config { dev_mode: true, ..Config::default() });
        runtime.failure_guard.record_failure("session-3", "tool", "timeout");
        runtime.failure_guard.record_failure("session-3", "tool", "timeout");
        runtime.failure_guard.record_failure("session-3", "tool", "timeout");
        let context = runtime.assemble_context("session-3", "ping").await.unwrap();
        assert!(context.contains("step back"));
    }
}
