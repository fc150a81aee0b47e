//! `ObservationStore`: a bounded ring buffer of raw tool/adapter
//! observations, kept for debugging rather than audit. Payloads are
//! truncated before being retained so one noisy tool call can't blow
//! out memory.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

const MAX_PAYLOAD_CHARS: usize = 20_000;

#[derive(Debug, Clone)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: String,
    pub truncated: bool,
}

pub struct ObservationStore {
    capacity: usize,
    ring: Mutex<VecDeque<Observation>>,
}

impl ObservationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, source: &str, payload: &str) {
        let truncated = payload.chars().count() > MAX_PAYLOAD_CHARS;
        let stored_payload: String = if truncated {
            payload.chars().take(MAX_PAYLOAD_CHARS).collect()
        } else {
            payload.to_string()
        };

        let observation = Observation {
            timestamp: Utc::now(),
            source: source.to_string(),
            payload: stored_payload,
            truncated,
        };

        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(observation);
    }

    pub fn recent(&self, limit: usize) -> Vec<Observation> {
        let ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_once_at_capacity() {
        let store = ObservationStore::new(2);
        store.push("a", "one");
        store.push("b", "two");
        store.push("c", "three");
        assert_eq!(store.len(), 2);
        let recent = store.recent(10);
        assert_eq!(recent[0].source, "c");
        assert_eq!(recent[1].source, "b");
    }

    #[test]
    fn oversized_payload_is_truncated_and_flagged() {
        let store = ObservationStore::new(4);
        let big = "x".repeat(MAX_PAYLOAD_CHARS + 500);
        store.push("tool", &big);
        let recent = store.recent(1);
        assert!(recent[0].truncated);
        assert_eq!(recent[0].payload.chars().count(), MAX_PAYLOAD_CHARS);
    }
}
