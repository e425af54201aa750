use std::time::{Duration, Instant};

use crate::probe::event::{EventKind, Mechanism};

/// Which signal decided a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionSource {
    /// The race-winner probe named the mechanism.
    Explicit,
    /// The mechanism with the lower latency in a race-timing event.
    Latency,
}

impl ResolutionSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Latency => "latency",
        }
    }
}

/// Final outcome of a block race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    Winner {
        mechanism: Mechanism,
        source: ResolutionSource,
        /// Latency difference, when both sides were observed.
        margin: Option<Duration>,
    },
    /// Both mechanisms delivered with exactly the same latency.
    Tie { latency: Duration },
}

/// Lifecycle state of a height as seen by the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceState {
    Unseen,
    Partial,
    Resolved,
    Retired,
}

/// Correlation state for one block height.
#[derive(Debug, Clone)]
pub struct RaceRecord {
    pub height: u64,
    pub created_at: Instant,
    /// Bitmask of [`EventKind::bit`] for every kind seen so far.
    seen: u8,
    pub outcome: Option<RaceOutcome>,
}

impl RaceRecord {
    pub fn new(height: u64, now: Instant) -> Self {
        Self {
            height,
            created_at: now,
            seen: 0,
            outcome: None,
        }
    }

    pub fn has_seen(&self, kind: EventKind) -> bool {
        self.seen & kind.bit() != 0
    }

    /// Mark `kind` as seen. Returns false when it already was.
    pub fn mark(&mut self, kind: EventKind) -> bool {
        let first = !self.has_seen(kind);
        self.seen |= kind.bit();
        first
    }

    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Whether any event taking part in the race was observed.
    pub fn saw_race_event(&self) -> bool {
        EventKind::all()
            .into_iter()
            .any(|k| k.is_race_event() && self.has_seen(k))
    }

    /// Resolved, connected, and the timing report is in.
    pub fn is_complete(&self) -> bool {
        self.is_resolved()
            && self.has_seen(EventKind::BlockConnected)
            && self.has_seen(EventKind::RaceTiming)
    }

    /// An unresolved record that took part in a race is abandoned on eviction.
    pub fn is_abandoned_race(&self) -> bool {
        !self.is_resolved() && self.saw_race_event()
    }

    pub fn state(&self) -> RaceState {
        if self.is_resolved() {
            RaceState::Resolved
        } else {
            RaceState::Partial
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_reports_first_arrival_only() {
        let mut rec = RaceRecord::new(100, Instant::now());
        assert!(rec.mark(EventKind::SendStart));
        assert!(!rec.mark(EventKind::SendStart));
        assert!(rec.has_seen(EventKind::SendStart));
        assert!(!rec.has_seen(EventKind::RaceWinner));
    }

    #[test]
    fn test_connected_only_is_not_a_race() {
        let mut rec = RaceRecord::new(100, Instant::now());
        rec.mark(EventKind::BlockConnected);
        assert!(!rec.saw_race_event());
        assert!(!rec.is_abandoned_race());
        assert_eq!(rec.state(), RaceState::Partial);

        rec.mark(EventKind::Reconstructed);
        assert!(rec.is_abandoned_race());
    }

    #[test]
    fn test_complete_requires_resolution_connection_and_timing() {
        let mut rec = RaceRecord::new(100, Instant::now());
        rec.mark(EventKind::RaceWinner);
        rec.mark(EventKind::BlockConnected);
        rec.outcome = Some(RaceOutcome::Winner {
            mechanism: Mechanism::Fast,
            source: ResolutionSource::Explicit,
            margin: None,
        });
        assert!(!rec.is_complete());

        rec.mark(EventKind::RaceTiming);
        assert!(rec.is_complete());
        assert_eq!(rec.state(), RaceState::Resolved);
    }
}
