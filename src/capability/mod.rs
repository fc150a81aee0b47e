//! `CapabilityStore`: short-lived grants that let a tool call skip the
//! approval gate it would otherwise require. Grants are consumed
//! atomically and pruned once expired.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A short-lived, use-counted right to invoke one capability within one
/// scope. Grants are single-capability by design (matching the data
/// model's `capability` field, not a set) so that `consume_required` can
/// satisfy a set of distinct capabilities from distinct grants and prove,
/// per capability, which grant's use count it decremented.
#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub id: Uuid,
    pub scope_key: String,
    pub capability: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub remaining_uses: Option<u32>,
}

impl CapabilityGrant {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at || self.remaining_uses == Some(0)
    }
}

#[derive(Default)]
pub struct CapabilityStore {
    grants: Mutex<HashMap<Uuid, CapabilityGrant>>,
}

impl CapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, grant: CapabilityGrant) {
        let mut guard = self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.insert(grant.id, grant);
    }

    /// Atomically consume one grant per distinct capability in `required`,
    /// all scoped to `scope_key`. Every distinct capability must have a
    /// live, covering grant (earliest-expiry wins the tie-break) before
    /// anything is decremented; if any is missing, no grant is touched and
    /// `None` is returned. On success, returns the id of the grant
    /// consumed for each distinct capability, in the same order they first
    /// appear in `required`.
    pub fn consume_required(&self, scope_key: &str, required: &[String], now: DateTime<Utc>) -> Option<Vec<Uuid>> {
        let mut guard = self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        guard.retain(|_, g| !g.is_expired(now));

        let mut distinct: Vec<&String> = Vec::new();
        for cap in required {
            if !distinct.contains(&cap) {
                distinct.push(cap);
            }
        }

        let mut chosen: Vec<Uuid> = Vec::new();
        for cap in &distinct {
            let candidate = guard
                .values()
                .filter(|g| g.scope_key == scope_key && &&g.capability == cap && !chosen.contains(&g.id))
                .min_by_key(|g| g.expires_at)
                .map(|g| g.id);
            match candidate {
                Some(id) => chosen.push(id),
                None => return None,
            }
        }

        for id in &chosen {
            if let Some(grant) = guard.get_mut(id) {
                if let Some(remaining) = grant.remaining_uses.as_mut() {
                    *remaining = remaining.saturating_sub(1);
                }
                if grant.is_expired(now) {
                    guard.remove(id);
                }
            }
        }

        Some(chosen)
    }

    /// Drop every expired grant; called opportunistically (e.g. each
    /// heartbeat tick) to bound memory use.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut guard = self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.retain(|_, g| !g.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.grants.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
