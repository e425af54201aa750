use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{EventKind, EVENT_KIND_CARDINALITY};

/// Lock-free per-EventKind counters plus a rejected-record counter.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct EventStats {
    counts: [AtomicU64; EVENT_KIND_CARDINALITY],
    rejected: AtomicU64,
}

/// Counters drained by one `snapshot()` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub per_kind: Vec<(EventKind, u64)>,
    pub rejected: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.per_kind.iter().map(|(_, v)| v).sum()
    }
}

impl EventStats {
    /// Create a new zeroed EventStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            rejected: AtomicU64::new(0),
        }
    }

    /// Increment the counter for the given event kind by one.
    pub fn record(&self, kind: EventKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a record the normalizer rejected.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters, returning only non-zero kinds.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut per_kind = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = EventKind::from_index(i) {
                    per_kind.push((kind, v));
                }
            }
        }

        StatsSnapshot {
            per_kind,
            rejected: self.rejected.swap(0, Ordering::Relaxed),
        }
    }
}

impl Default for EventStats {
    fn default() -> Self {
        Self::new()
    }
}
