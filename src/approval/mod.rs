//! `ApprovalWorkflow`: holds pending human-in-the-loop approval requests,
//! deduplicates repeated asks for the same effective action, and turns a
//! granted decision into a `CapabilityGrant`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::capability::CapabilityGrant;

const EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub tool: String,
    pub intent: String,
    pub plan: String,
    pub required_capabilities: Vec<String>,
    pub provenance: String,
    pub untrusted: bool,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

#[derive(Default)]
pub struct ApprovalWorkflow {
    pending: Mutex<HashMap<Uuid, ApprovalRequest>>,
    /// fingerprint -> request id, so a repeated ask for the same
    /// effective action returns the existing pending request instead of
    /// creating a duplicate.
    by_fingerprint: Mutex<HashMap<String, Uuid>>,
}

pub struct RequestOutcome {
    pub request: ApprovalRequest,
    pub deduplicated: bool,
}

impl ApprovalWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// The key grants are scoped under once resolved: untrusted
    /// provenance gets its own namespace so an approval granted for
    /// trusted input never silently covers an untrusted repeat.
    pub fn scope_key(tool: &str, intent: &str, untrusted: bool) -> String {
        if untrusted {
            format!("untrusted:{tool}:{intent}")
        } else {
            format!("{tool}:{intent}")
        }
    }

    fn fingerprint(tool: &str, intent: &str, plan: &str, required_capabilities: &[String], provenance: &str) -> String {
        let mut sorted = required_capabilities.to_vec();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update(b"\0");
        hasher.update(intent.as_bytes());
        hasher.update(b"\0");
        hasher.update(plan.as_bytes());
        hasher.update(b"\0");
        hasher.update(sorted.join(",").as_bytes());
        hasher.update(b"\0");
        hasher.update(provenance.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Request approval for an action. If an equivalent request (same
    /// fingerprint) is already pending, that request is returned instead
    /// of creating a new one.
    pub fn request(
        &self,
        tool: &str,
        intent: &str,
        plan: &str,
        required_capabilities: Vec<String>,
        provenance: &str,
        untrusted: bool,
    ) -> RequestOutcome {
        let fingerprint = Self::fingerprint(tool, intent, plan, &required_capabilities, provenance);

        let mut by_fp = self.by_fingerprint.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing_id) = by_fp.get(&fingerprint) {
            let pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(existing) = pending.get(existing_id) {
                return RequestOutcome {
                    request: existing.clone(),
                    deduplicated: true,
                };
            }
        }

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            tool: tool.to_string(),
            intent: intent.to_string(),
            plan: plan.to_string(),
            required_capabilities,
            provenance: provenance.to_string(),
            untrusted,
            created_at: Utc::now(),
            fingerprint: fingerprint.clone(),
        };

        by_fp.insert(fingerprint, request.id);
        drop(by_fp);

        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        pending.insert(request.id, request.clone());

        RequestOutcome {
            request,
            deduplicated: false,
        }
    }

    /// Resolve a pending request. An `Approved` decision creates one
    /// `CapabilityGrant` per required capability, all sharing the
    /// request's scope key, each with `uses` remaining uses (`None` for
    /// unlimited) — the caller inserts them into the `CapabilityStore`.
    /// `Denied` and unknown ids return `None`.
    pub fn resolve(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        grant_ttl: Duration,
        uses: Option<u32>,
    ) -> Option<Vec<CapabilityGrant>> {
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let request = pending.remove(&request_id)?;

        let mut by_fp = self.by_fingerprint.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        by_fp.remove(&request.fingerprint);
        drop(by_fp);

        if decision != ApprovalDecision::Approved {
            return None;
        }

        let now = Utc::now();
        let scope_key = Self::scope_key(&request.tool, &request.intent, request.untrusted);
        Some(
            request
                .required_capabilities
                .into_iter()
                .map(|capability| CapabilityGrant {
                    id: Uuid::new_v4(),
                    scope_key: scope_key.clone(),
                    capability,
                    granted_at: now,
                    expires_at: now + grant_ttl,
                    remaining_uses: uses,
                })
                .collect(),
        )
    }

    /// Drop pending requests older than the expiry window; called
    /// opportunistically on the heartbeat tick.
    pub fn sweep_expired(&self, now: DateTime<Utc>) {
        let mut pending = self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut by_fp = self.by_fingerprint.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let expired: Vec<Uuid> = pending
            .values()
            .filter(|r| now - r.created_at >= Duration::hours(EXPIRY_HOURS))
            .map(|r| r.id)
            .collect();

        for id in expired {
            if let Some(request) = pending.remove(&id) {
                by_fp.remove(&request.fingerprint);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_identical_request_deduplicates() {
        let workflow = ApprovalWorkflow::new();
        let first = workflow.request("exec", "run", "ls -la", vec!["exec".into()], "user", false);
        let second = workflow.request("exec", "run", "ls -la", vec!["exec".into()], "user", false);
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.request.id, second.request.id);
        assert_eq!(workflow.pending_count(), 1);
    }

    #[test]
    fn different_plan_is_not_deduplicated() {
        let workflow = ApprovalWorkflow::new();
        let first = workflow.request("exec", "run", "ls -la", vec!["exec".into()], "user", false);
        let second = workflow.request("exec", "run", "rm -rf /tmp/x", vec!["exec".into()], "user", false);
        assert_ne!(first.request.id, second.request.id);
        assert_eq!(workflow.pending_count(), 2);
    }

    #[test]
    fn resolve_approved_yields_one_grant_per_required_capability() {
        let workflow = ApprovalWorkflow::new();
        let outcome = workflow.request(
            "exec",
            "mutating",
            "rm /tmp/x",
            vec!["process.exec".into(), "fs.write".into(), "process.exec.mutate".into()],
            "user",
            false,
        );
        let grants = workflow
            .resolve(outcome.request.id, ApprovalDecision::Approved, Duration::minutes(30), Some(1))
            .unwrap();
        assert_eq!(grants.len(), 3);
        assert!(grants.iter().all(|g| g.scope_key == "exec:mutating"));
        assert!(grants.iter().any(|g| g.capability == "process.exec"));
        assert!(grants.iter().any(|g| g.capability == "fs.write"));
        assert!(grants.iter().any(|g| g.capability == "process.exec.mutate"));
        assert_eq!(workflow.pending_count(), 0);
    }

    #[test]
    fn resolve_denied_yields_no_grant() {
        let workflow = ApprovalWorkflow::new();
        let outcome = workflow.request("exec", "run", "ls", vec!["exec".into()], "user", false);
        let grant = workflow.resolve(outcome.request.id, ApprovalDecision::Denied, Duration::minutes(30), None);
        assert!(grant.is_none());
    }

    #[test]
    fn untrusted_provenance_scopes_separately() {
        let key_trusted = ApprovalWorkflow::scope_key("exec", "run", false);
        let key_untrusted = ApprovalWorkflow::scope_key("exec", "run", true);
        assert_ne!(key_trusted, key_untrusted);
    }

    #[test]
    fn sweep_expired_removes_old_pending_requests() {
        let workflow = ApprovalWorkflow::new();
        let outcome = workflow.request("exec", "run", "ls", vec!["exec".into()], "user", false);
        let mut stale = outcome.request.clone();
        stale.created_at = Utc::now() - Duration::hours(25);
        workflow.pending.lock().unwrap().insert(stale.id, stale);
        workflow.sweep_expired(Utc::now());
        assert_eq!(workflow.pending_count(), 0);
    }
}
