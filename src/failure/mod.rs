//! `FailureLoopGuard` breaks an agent out of repeating the same failure
//! forever by normalizing a failure into a signature and escalating once
//! the same signature repeats past a threshold. `ReasoningResetController`
//! is the escalation action: it clears short-term reasoning state so the
//! next attempt isn't primed by the same dead end. `DeepScanService`
//! does a bounded scan of recently-touched files as a last-resort
//! integrity check once escalation fires.

mod deep_scan;

pub use deep_scan::{DeepScanReport, DeepScanService};

use std::collections::HashMap;
use std::sync::Mutex;

/// Normalize a failure into a stable signature: lowercase, digit runs
/// collapsed to `#`, whitespace collapsed, truncated to 300 chars. Two
/// failures that differ only in a retry count or a transient id collapse
/// to the same signature.
pub fn normalize_signature(name: &str, message: &str) -> String {
    let raw = format!("{name}:{message}").to_lowercase();

    let mut collapsed = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut last_was_space = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            collapsed.push('#');
            while matches!(chars.peek(), Some(c) if c.is_ascii_digit()) {
                chars.next();
            }
            last_was_space = false;
            continue;
        }
        if c.is_whitespace() {
            if !last_was_space {
                collapsed.push(' ');
            }
            last_was_space = true;
            continue;
        }
        collapsed.push(c);
        last_was_space = false;
    }

    collapsed.trim().chars().take(300).collect()
}

struct SessionFailureState {
    signature: String,
    count: u32,
}

/// Per-session `{signature, count}`: only the most recent signature is
/// tracked for a session, so a failure whose normalized form differs
/// from the last one resets the count rather than accumulating beside
/// it.
pub struct FailureLoopGuard {
    threshold: u32,
    sessions: Mutex<HashMap<String, SessionFailureState>>,
}

impl FailureLoopGuard {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Record one failure for `session_id`. Returns `true` once the
    /// session's current signature count reaches the threshold; it keeps
    /// returning `true` on further calls with the same signature until
    /// `record_success` clears the session.
    pub fn record_failure(&self, session_id: &str, name: &str, message: &str) -> bool {
        let signature = normalize_signature(name, message);
        let mut guard = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = guard.entry(session_id.to_string()).or_insert_with(|| SessionFailureState {
            signature: signature.clone(),
            count: 0,
        });
        if state.signature != signature {
            state.signature = signature;
            state.count = 0;
        }
        state.count += 1;
        state.count >= self.threshold
    }

    /// Whether `session_id`'s current failure streak has already reached
    /// the escalation threshold, without recording a new failure.
    pub fn requires_step_back(&self, session_id: &str) -> bool {
        let guard = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(session_id).map(|s| s.count >= self.threshold).unwrap_or(false)
    }

    /// Clear `session_id`'s streak, typically after a turn completes
    /// successfully.
    pub fn record_success(&self, session_id: &str) {
        let mut guard = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.remove(session_id);
    }

    pub fn reset_all(&self) {
        let mut guard = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.clear();
    }

    pub fn count_for(&self, session_id: &str) -> u32 {
        let guard = self.sessions.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.get(session_id).map(|s| s.count).unwrap_or(0)
    }
}

/// Tracks how many consecutive escalations have fired so the caller can
/// decide when a reasoning reset itself needs to hand off to a human
/// (e.g. after repeated resets still don't break the loop).
pub struct ReasoningResetController {
    reset_count: Mutex<u32>,
}

impl Default for ReasoningResetController {
    fn default() -> Self {
        Self {
            reset_count: Mutex::new(0),
        }
    }
}

impl ReasoningResetController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform a reset, returning the new consecutive-reset count.
    pub fn trigger_reset(&self) -> u32 {
        let mut count = self.reset_count.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *count += 1;
        *count
    }

    /// Call on a successful turn to clear the consecutive-reset streak.
    pub fn on_turn_succeeded(&self) {
        let mut count = self.reset_count.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *count = 0;
    }

    pub fn consecutive_resets(&self) -> u32 {
        *self.reset_count.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_signature_collapses_digit_runs_and_whitespace() {
        let a = normalize_signature("ToolError", "file /tmp/run-482.log not found  at line 12");
        let b = normalize_signature("ToolError", "file /tmp/run-999.log not found at line 77");
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_signature_truncates_to_300_chars() {
        let long_message = "x".repeat(500);
        let signature = normalize_signature("err", &long_message);
        assert_eq!(signature.chars().count(), 300);
    }

    #[test]
    fn guard_escalates_at_threshold_and_keeps_escalating() {
        let guard = FailureLoopGuard::new(2);
        assert!(!guard.record_failure("s1", "ToolError", "timeout on run 1"));
        assert!(guard.record_failure("s1", "ToolError", "timeout on run 2"));
        assert!(guard.record_failure("s1", "ToolError", "timeout on run 3"));
        assert!(guard.requires_step_back("s1"));
    }

    #[test]
    fn record_success_clears_the_session() {
        let guard = FailureLoopGuard::new(2);
        guard.record_failure("s1", "ToolError", "timeout on run 1");
        guard.record_failure("s1", "ToolError", "timeout on run 2");
        guard.record_success("s1");
        assert_eq!(guard.count_for("s1"), 0);
        assert!(!guard.requires_step_back("s1"));
    }

    #[test]
    fn a_different_signature_resets_the_streak_instead_of_tracking_alongside_it() {
        let guard = FailureLoopGuard::new(2);
        guard.record_failure("s1", "ToolError", "timeout");
        assert!(!guard.record_failure("s1", "OtherError", "connection refused"));
        // threshold is 2 but the signature changed, so this is the first
        // occurrence of the new signature, not the second overall.
        assert!(!guard.requires_step_back("s1"));
    }

    #[test]
    fn sessions_are_tracked_independently() {
        let guard = FailureLoopGuard::new(2);
        guard.record_failure("s1", "ToolError", "timeout");
        guard.record_failure("s2", "ToolError", "timeout");
        assert_eq!(guard.count_for("s1"), 1);
        assert_eq!(guard.count_for("s2"), 1);
    }

    #[test]
    fn spec_scenario_four_digit_variation_collapses_to_same_signature() {
        let guard = FailureLoopGuard::new(2);
        guard.record_failure("s1", "compile", "failed at line 10");
        assert!(guard.record_failure("s1", "compile", "failed at line 12"));
        assert!(guard.requires_step_back("s1"));
        guard.record_success("s1");
        assert!(!guard.requires_step_back("s1"));
    }

    #[test]
    fn reasoning_reset_controller_tracks_consecutive_resets() {
        let controller = ReasoningResetController::new();
        assert_eq!(controller.trigger_reset(), 1);
        assert_eq!(controller.trigger_reset(), 2);
        controller.on_turn_succeeded();
        assert_eq!(controller.consecutive_resets(), 0);
    }
}
