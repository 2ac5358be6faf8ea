use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::store::Applied;

/// Counters describing how the engine merged its inputs
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    /// Realtime events that changed the store
    pub events_applied: u64,
    /// Re-deliveries and stale updates
    pub events_ignored: u64,
    pub events_rejected: u64,
    /// Realtime events by scope ("channel:general" -> count)
    pub events_by_scope: HashMap<String, u64>,
    pub pages_loaded: u64,
    pub page_failures: u64,
    pub mutations_confirmed: u64,
    pub mutations_rolled_back: u64,
    /// Responses that landed after their session was closed
    pub responses_discarded: u64,
    pub resubscribes: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, scope: &str, applied: &Applied) {
        *self.events_by_scope.entry(scope.to_string()).or_insert(0) += 1;
        match applied {
            Applied::Changed => self.events_applied += 1,
            Applied::Unchanged => self.events_ignored += 1,
            Applied::Rejected(_) => self.events_rejected += 1,
        }
    }

    /// Scopes sorted by event count (descending)
    pub fn busiest_scopes(&self) -> Vec<(String, u64)> {
        let mut scopes: Vec<_> = self
            .events_by_scope
            .iter()
            .map(|(s, &c)| (s.clone(), c))
            .collect();
        scopes.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scopes
    }
}

/// Thread-safe wrapper for sync stats
#[derive(Debug, Clone, Default)]
pub struct SharedSyncStats {
    inner: Arc<RwLock<SyncStats>>,
}

impl SharedSyncStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.inner.write());
    }

    pub fn snapshot(&self) -> SyncStats {
        self.inner.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn test_record_event_buckets() {
        let mut stats = SyncStats::new();
        stats.record_event("channel:a", &Applied::Changed);
        stats.record_event("channel:a", &Applied::Unchanged);
        stats.record_event("channel:b", &Applied::Rejected(SyncError::validation("x")));

        assert_eq!(stats.events_applied, 1);
        assert_eq!(stats.events_ignored, 1);
        assert_eq!(stats.events_rejected, 1);
        assert_eq!(
            stats.busiest_scopes(),
            vec![("channel:a".to_string(), 2), ("channel:b".to_string(), 1)]
        );
    }

    #[test]
    fn test_shared_snapshot() {
        let shared = SharedSyncStats::new();
        let clone = shared.clone();
        clone.update(|s| s.pages_loaded += 2);
        assert_eq!(shared.snapshot().pages_loaded, 2);
    }
}
