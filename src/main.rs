//! Thin binary wiring for `haven-core`: loads configuration, constructs
//! every collaborator the library exposes, starts the autonomy tick loop
//! in the background, and drives turns from stdin. A real deployment
//! (gateway, channel adapters, persona layer) lives outside this crate;
//! this binary exists so the execution core can be exercised end to end.

use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use haven_core::adapter::http::{HttpAdapter, HttpConfig};
use haven_core::adapter::synthetic::SyntheticAdapter;
use haven_core::adapter::FallbackChain;
use haven_core::approval::ApprovalWorkflow;
use haven_core::autonomy::{AutonomyOrchestrator, CronJobRunner};
use haven_core::capability::CapabilityStore;
use haven_core::config::Config;
use haven_core::failure::{DeepScanService, FailureLoopGuard, ReasoningResetController};
use haven_core::journal::{DecisionJournal, ObservationStore};
use haven_core::memory::MemoryStore;
use haven_core::privacy::PrivacyScrubber;
use haven_core::run::{LifecycleStream, RunStore};
use haven_core::safefetch::{SafeFetch, SafeFetchConfig};
use haven_core::scheduler::{AutonomyBudget, CronJob, CronService, HeartbeatRunner};
use haven_core::tools::exec::ExecTool;
use haven_core::tools::web_fetch::WebFetchTool;
use haven_core::tools::{ToolRouter, ToolRouterConfig};
use haven_core::turn::TurnRuntime;

struct NoopCronJobRunner;

#[async_trait::async_trait]
impl CronJobRunner for NoopCronJobRunner {
    async fn run_job(&self, job: &CronJob) -> std::result::Result<(), String> {
        tracing::info!(job_id = %job.id, "scheduled job has no registered action; skipping");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("haven.toml"));
    let config = Arc::new(Config::load(&config_path)?);

    let workspace_dir = config.workspace_dir.clone();
    std::fs::create_dir_all(&workspace_dir)?;

    let capabilities = Arc::new(CapabilityStore::new());
    let approvals = Arc::new(ApprovalWorkflow::new());
    let scrubber = Arc::new(PrivacyScrubber::new(config.privacy.fail_closed_on_error));
    let journal = Arc::new(DecisionJournal::new(workspace_dir.join("decision-journal.jsonl")));
    let observations = Arc::new(ObservationStore::new(256));
    let memory = Arc::new(MemoryStore::new(workspace_dir.clone()));
    let runs = Arc::new(RunStore::new(512));
    let lifecycle = Arc::new(LifecycleStream::new(256));
    let failure_guard = Arc::new(FailureLoopGuard::new(3));
    let reasoning_reset = Arc::new(ReasoningResetController::new());
    let deep_scan = Arc::new(DeepScanService::new(workspace_dir.clone()));
    let heartbeat = Arc::new(HeartbeatRunner::new(&config.heartbeat));
    let budget = Arc::new(AutonomyBudget::new(&config.autonomy_budget));
    let cron = Arc::new(
        CronService::new(config.reliability.max_concurrent_cron_runs)
            .with_snapshot_path(workspace_dir.join("cron-snapshot.json")),
    );
    for job in CronService::load_snapshot(&workspace_dir.join("cron-snapshot.json"))? {
        cron.add_job(job)?;
    }

    let mut router = ToolRouter::new(
        capabilities.clone(),
        approvals.clone(),
        scrubber.clone(),
        journal.clone(),
        ToolRouterConfig::default(),
    );
    router.register(Arc::new(ExecTool {
        allowed_commands: config.tools.allowed_commands.clone(),
        forbidden_paths: config.tools.forbidden_paths.clone(),
        timeout: Duration::from_secs(config.tools.exec_timeout_secs),
        max_buffer_bytes: config.tools.exec_max_buffer_bytes,
    }));
    let safe_fetch = Arc::new(SafeFetch::new(SafeFetchConfig {
        max_redirects: config.tools.fetch_max_redirects,
        connect_timeout: Duration::from_secs(10),
        max_body_bytes: config.tools.fetch_max_body_bytes,
    }));
    router.register(Arc::new(WebFetchTool::new(safe_fetch)?));
    let tool_router = Arc::new(router);

    let mut adapters: Vec<Arc<dyn haven_core::adapter::ModelAdapter>> = Vec::new();
    adapters.push(Arc::new(HttpAdapter::new(
        config.models.default_model.clone(),
        HttpConfig {
            base_url: "http://localhost:11434".to_string(),
            model: config.models.default_model.clone(),
            request_timeout: Duration::from_secs(120),
        },
    )?));
    for fallback in &config.models.fallback_models {
        adapters.push(Arc::new(HttpAdapter::new(
            fallback.clone(),
            HttpConfig {
                base_url: "http://localhost:11434".to_string(),
                model: fallback.clone(),
                request_timeout: Duration::from_secs(120),
            },
        )?));
    }
    adapters.push(Arc::new(SyntheticAdapter::new("synthetic-fallback")));
    let fallback_chain = Arc::new(FallbackChain::new(adapters));

    let turn_runtime = Arc::new(TurnRuntime::new(
        config.clone(),
        fallback_chain,
        tool_router,
        memory,
        journal,
        observations.clone(),
        scrubber,
        runs,
        lifecycle,
        failure_guard,
        reasoning_reset,
        deep_scan,
    ));

    let orchestrator = Arc::new(AutonomyOrchestrator::new(
        heartbeat,
        cron,
        budget,
        approvals,
        capabilities,
        observations,
        Arc::new(NoopCronJobRunner),
    ));

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let autonomy_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(shutdown_rx).await })
    };

    run_stdin_loop(turn_runtime).await?;

    autonomy_handle.abort();
    Ok(())
}

/// Reads one line at a time from stdin as turn input for a single fixed
/// session, printing the model's reply. A stand-in for whatever channel
/// transport a deployment actually wires in front of the execution core.
async fn run_stdin_loop(turn_runtime: Arc<TurnRuntime>) -> Result<()> {
    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            print!("> ");
            io::stdout().flush()?;
            continue;
        }
        match turn_runtime.run_turn("stdin", &line).await {
            Ok(outcome) => println!("{}", outcome.text),
            Err(err) => eprintln!("turn failed: {err}"),
        }
        print!("> ");
        io::stdout().flush()?;
    }
    Ok(())
}
