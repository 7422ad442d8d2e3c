//! Per-entity-id monotonic apply for mutation responses.

use std::collections::HashMap;
use std::sync::Mutex;

use timekeep_protocol::EntityKind;

#[derive(Debug, Default)]
pub struct StaleResponseGuard {
    applied: Mutex<HashMap<(EntityKind, String), u64>>,
}

impl StaleResponseGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `logical_ts` as applied for the id and returns true, unless a
    /// newer mutation's response was already applied.
    pub fn admit(&self, entity: EntityKind, id: &str, logical_ts: u64) -> bool {
        let mut applied = self
            .applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let key = (entity, id.to_string());
        match applied.get(&key) {
            Some(latest) if *latest >= logical_ts => false,
            _ => {
                applied.insert(key, logical_ts);
                true
            }
        }
    }

    pub fn latest(&self, entity: EntityKind, id: &str) -> Option<u64> {
        self.applied
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(entity, id.to_string()))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_response_after_newer_is_rejected() {
        let guard = StaleResponseGuard::new();
        assert!(guard.admit(EntityKind::Projects, "p1", 2));
        assert!(!guard.admit(EntityKind::Projects, "p1", 1));
        assert_eq!(guard.latest(EntityKind::Projects, "p1"), Some(2));
    }

    #[test]
    fn ids_and_kinds_are_independent() {
        let guard = StaleResponseGuard::new();
        assert!(guard.admit(EntityKind::Projects, "p1", 5));
        assert!(guard.admit(EntityKind::Projects, "p2", 1));
        assert!(guard.admit(EntityKind::Clients, "p1", 1));
    }
}
