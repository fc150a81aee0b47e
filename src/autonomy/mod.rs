//! `AutonomyOrchestrator`: the top-level tick loop for everything the
//! agent does without a human driving a turn directly — cron jobs, the
//! adaptive heartbeat, and the housekeeping sweeps (expired approvals,
//! expired capability grants) that would otherwise only ever run on a
//! live turn. Shaped after a cron scheduler's own tick loop, generalized
//! to also age the heartbeat and gate everything behind the autonomy
//! budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::approval::ApprovalWorkflow;
use crate::capability::CapabilityStore;
use crate::journal::ObservationStore;
use crate::scheduler::{AutonomyBudget, CronJob, CronService, HeartbeatRunner, TickOutcome};

/// Executes the action a due `CronJob` represents. The orchestrator only
/// knows how to schedule and retry; what a job actually does (trigger a
/// turn, run a workflow, ping a channel) is supplied by the caller.
#[async_trait::async_trait]
pub trait CronJobRunner: Send + Sync {
    async fn run_job(&self, job: &CronJob) -> std::result::Result<(), String>;
}

pub struct AutonomyOrchestrator {
    heartbeat: Arc<HeartbeatRunner>,
    cron: Arc<CronService>,
    budget: Arc<AutonomyBudget>,
    approvals: Arc<ApprovalWorkflow>,
    capabilities: Arc<CapabilityStore>,
    observations: Arc<ObservationStore>,
    job_runner: Arc<dyn CronJobRunner>,
}

impl AutonomyOrchestrator {
    pub fn new(
        heartbeat: Arc<HeartbeatRunner>,
        cron: Arc<CronService>,
        budget: Arc<AutonomyBudget>,
        approvals: Arc<ApprovalWorkflow>,
        capabilities: Arc<CapabilityStore>,
        observations: Arc<ObservationStore>,
        job_runner: Arc<dyn CronJobRunner>,
    ) -> Self {
        Self {
            heartbeat,
            cron,
            budget,
            approvals,
            capabilities,
            observations,
            job_runner,
        }
    }

    /// Runs ticks at the heartbeat's current interval until `shutdown`
    /// fires. The interval is re-read every iteration so a tick that
    /// raises or lowers pressure takes effect on the very next wait.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval_ms = self.heartbeat.current_interval_ms();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }

            self.tick(Utc::now()).await;
        }
    }

    /// One heartbeat cycle: age the interval, sweep expired approvals and
    /// capability grants, then run any due cron jobs if the autonomy
    /// budget allows it.
    pub async fn tick(&self, now: DateTime<Utc>) {
        self.heartbeat.update(self.observations.len() as u64);
        self.approvals.sweep_expired(now);
        self.capabilities.prune(now);

        if !self.budget.try_consume("autonomy", now) {
            tracing::debug!("autonomy budget exhausted or in quiet hours; skipping this tick's cron run");
            return;
        }

        let runner = self.job_runner.clone();
        let result = self
            .cron
            .tick(now, move |job| {
                let runner = runner.clone();
                async move {
                    match runner.run_job(&job).await {
                        Ok(()) => TickOutcome::Succeeded,
                        Err(message) => TickOutcome::Failed(message),
                    }
                }
            })
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "cron tick failed to persist its snapshot");
        }
    }
}
