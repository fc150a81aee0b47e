//! `WorkflowRuntime`: runs an ordered list of steps exactly once each,
//! identified by `(workflow_id, idempotency_key)`. Progress is persisted
//! after every completed step so a crash mid-workflow resumes instead of
//! re-running already-applied steps.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approval::ApprovalWorkflow;
use crate::capability::CapabilityStore;
use crate::error::{CoreError, Result};

pub struct WorkflowStep<F> {
    pub id: String,
    pub requires_approval: bool,
    pub run: F,
}

pub enum StepOutcome {
    Completed,
    /// Blocked on a pending (or freshly requested) approval for a step;
    /// the caller should resolve the request and re-invoke `run` with
    /// the same idempotency key once granted.
    PendingApproval(Uuid),
    Failed(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkflowState {
    completed_step_ids: HashSet<String>,
}

pub struct WorkflowRuntime {
    state_dir: PathBuf,
}

impl WorkflowRuntime {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into() }
    }

    fn state_path(&self, workflow_id: &str, idempotency_key: &str) -> PathBuf {
        self.state_dir.join(format!("{workflow_id}-{idempotency_key}.json"))
    }

    fn load_state(path: &Path) -> WorkflowState {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|body| serde_json::from_str(&body).ok())
            .unwrap_or_default()
    }

    fn save_state(path: &Path, state: &WorkflowState) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Other(e.into()))?;
        }
        let body = serde_json::to_string_pretty(state).map_err(|e| CoreError::Other(e.into()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body).map_err(|e| CoreError::Other(e.into()))?;
        std::fs::rename(&tmp, path).map_err(|e| CoreError::Other(e.into()))?;
        Ok(())
    }

    /// Runs each step that isn't already in the persisted completed set,
    /// in order, stopping on the first denial or failure. Steps already
    /// marked completed from a prior run are skipped entirely, which is
    /// what makes re-invoking the same `(workflow_id, idempotency_key)`
    /// safe after a crash.
    pub async fn run<F, Fut>(
        &self,
        workflow_id: &str,
        idempotency_key: &str,
        approvals: &ApprovalWorkflow,
        capabilities: &CapabilityStore,
        steps: Vec<WorkflowStep<F>>,
    ) -> Result<StepOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), String>>,
    {
        let path = self.state_path(workflow_id, idempotency_key);
        let mut state = Self::load_state(&path);

        for step in steps {
            if state.completed_step_ids.contains(&step.id) {
                continue;
            }

            if step.requires_approval {
                let scope_key = ApprovalWorkflow::scope_key("workflow", &step.id, false);
                let consumed = capabilities.consume_required(&scope_key, &["workflow_step".to_string()], Utc::now());
                if consumed.is_none() {
                    let plan = format!("run workflow step {step_id} of {workflow_id}/{idempotency_key}", step_id = step.id);
                    let outcome = approvals.request(
                        "workflow",
                        &step.id,
                        &plan,
                        vec!["workflow_step".to_string()],
                        workflow_id,
                        false,
                    );
                    return Ok(StepOutcome::PendingApproval(outcome.request.id));
                }
            }

            match (step.run)().await {
                Ok(()) => {
                    state.completed_step_ids.insert(step.id);
                    Self::save_state(&path, &state)?;
                }
                Err(message) => return Ok(StepOutcome::Failed(message)),
            }
        }

        Ok(StepOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn completed_steps_are_skipped_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WorkflowRuntime::new(dir.path());
        let approvals = ApprovalWorkflow::new();
        let capabilities = CapabilityStore::new();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let steps = vec![WorkflowStep {
            id: "step-a".to_string(),
            requires_approval: false,
            run: move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        }];
        let outcome = runtime.run("wf-1", "key-1", &approvals, &capabilities, steps).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let calls_clone = calls.clone();
        let steps = vec![WorkflowStep {
            id: "step-a".to_string(),
            requires_approval: false,
            run: move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        }];
        runtime.run("wf-1", "key-1", &approvals, &capabilities, steps).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "already-completed step must not rerun");
    }

    #[tokio::test]
    async fn step_requiring_approval_blocks_without_a_grant() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WorkflowRuntime::new(dir.path());
        let approvals = ApprovalWorkflow::new();
        let capabilities = CapabilityStore::new();

        let steps = vec![WorkflowStep {
            id: "step-a".to_string(),
            requires_approval: true,
            run: || async { Ok(()) },
        }];
        let outcome = runtime.run("wf-2", "key-1", &approvals, &capabilities, steps).await.unwrap();
        assert!(matches!(outcome, StepOutcome::PendingApproval(_)));
        assert_eq!(approvals.pending_count(), 1);
    }

    #[tokio::test]
    async fn step_requiring_approval_runs_once_a_grant_covers_it() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WorkflowRuntime::new(dir.path());
        let approvals = ApprovalWorkflow::new();
        let capabilities = CapabilityStore::new();

        capabilities.insert(crate::capability::CapabilityGrant {
            id: Uuid::new_v4(),
            scope_key: ApprovalWorkflow::scope_key("workflow", "step-a", false),
            capability: "workflow_step".to_string(),
            granted_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
            remaining_uses: None,
        });

        let steps = vec![WorkflowStep {
            id: "step-a".to_string(),
            requires_approval: true,
            run: || async { Ok(()) },
        }];
        let outcome = runtime.run("wf-2", "key-1", &approvals, &capabilities, steps).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed));
    }

    #[tokio::test]
    async fn failed_step_stops_the_run_without_completing_it() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = WorkflowRuntime::new(dir.path());
        let approvals = ApprovalWorkflow::new();
        let capabilities = CapabilityStore::new();

        let steps = vec![WorkflowStep {
            id: "step-a".to_string(),
            requires_approval: false,
            run: || async { Err("boom".to_string()) },
        }];
        let outcome = runtime.run("wf-3", "key-1", &approvals, &capabilities, steps).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed(_)));

        let state = WorkflowRuntime::load_state(&runtime.state_path("wf-3", "key-1"));
        assert!(!state.completed_step_ids.contains("step-a"));
    }
}
