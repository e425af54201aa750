//! Race correlator.
//!
//! Groups domain events by block height and decides, per height, which relay
//! mechanism won the race. The correlator is a pure state machine: time is
//! injected on every call and its output is a list of [`Emission`]s for the
//! metrics aggregator. It owns every in-flight [`RaceRecord`] and is driven
//! by a single writer.

pub mod record;

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::probe::event::{DomainEvent, EventKind, Mechanism, RaceTiming};

pub use self::record::{RaceOutcome, RaceRecord, RaceState, ResolutionSource};

/// How an exact latency tie is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Record a tie; no mechanism wins.
    #[default]
    Record,
    /// Credit the fast path.
    PreferFast,
    /// Credit the slow path.
    PreferSlow,
}

/// Why a record was retired before its lifecycle completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictReason {
    Age,
    Capacity,
}

impl EvictReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Capacity => "capacity",
        }
    }
}

/// Output of the correlator, consumed by the metrics aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// First arrival of an event kind for a live height.
    Accepted(EventKind),
    Reconstructed {
        height: u64,
        duration: Duration,
        chunks_used: u32,
        chunks_received: u32,
    },
    SendStart {
        height: u64,
    },
    /// Explicit delivery report from the race-winner probe.
    Delivery {
        height: u64,
        mechanism: Mechanism,
        peer: String,
    },
    Connected {
        height: u64,
        tx_count: u64,
        duration: Duration,
    },
    RaceLatency {
        mechanism: Mechanism,
        latency: Duration,
    },
    RaceMargin(Duration),
    RaceResolved {
        height: u64,
        outcome: RaceOutcome,
    },
    /// Explicit winner and latency comparison disagree.
    WinnerMismatch {
        height: u64,
        explicit: Mechanism,
        by_latency: Mechanism,
    },
    Duplicate(EventKind),
    /// Event for a height that was evicted; dropped.
    Late(EventKind),
    Abandoned {
        height: u64,
    },
    Evicted(EvictReason),
}

/// Correlator limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelatorConfig {
    /// Records older than this are retired by `sweep`.
    pub max_age: Duration,
    /// Hard cap on in-flight records.
    pub max_records: usize,
    /// How long retired heights are remembered.
    pub retired_retention: Duration,
    pub tie_policy: TiePolicy,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_records: 1024,
            retired_retention: Duration::from_secs(60 * 60),
            tie_policy: TiePolicy::Record,
        }
    }
}

/// A retired height.
///
/// A height retired because its lifecycle completed keeps its record, so an
/// event kind it never saw is still counted once. Evicted heights keep
/// nothing and every later event for them is late.
#[derive(Debug)]
struct Retired {
    completed: Option<RaceRecord>,
}

/// Per-height race state machine.
pub struct Correlator {
    config: CorrelatorConfig,
    records: HashMap<u64, RaceRecord>,
    retired: HashMap<u64, Retired>,
    /// Retired heights in retirement order, for pruning.
    retired_order: VecDeque<(u64, Instant)>,
}

impl Correlator {
    pub fn new(config: CorrelatorConfig) -> Self {
        Self {
            config,
            records: HashMap::with_capacity(64),
            retired: HashMap::with_capacity(64),
            retired_order: VecDeque::with_capacity(64),
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Number of in-flight records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn state(&self, height: u64) -> RaceState {
        if let Some(record) = self.records.get(&height) {
            record.state()
        } else if self.retired.contains_key(&height) {
            RaceState::Retired
        } else {
            RaceState::Unseen
        }
    }

    pub fn record(&self, height: u64) -> Option<&RaceRecord> {
        self.records.get(&height)
    }

    /// Apply one domain event.
    pub fn apply(&mut self, event: &DomainEvent, now: Instant) -> Vec<Emission> {
        let height = event.height();
        let kind = event.kind();
        let mut out = Vec::with_capacity(4);
        let tie_policy = self.config.tie_policy;

        if let Some(retired) = self.retired.get_mut(&height) {
            match retired.completed.as_mut() {
                Some(record) => {
                    if record.mark(kind) {
                        out.push(Emission::Accepted(kind));
                        first_arrival(record, event, tie_policy, &mut out);
                    } else {
                        out.push(Emission::Duplicate(kind));
                    }
                }
                None => out.push(Emission::Late(kind)),
            }
            return out;
        }

        if !self.records.contains_key(&height) {
            if self.records.len() >= self.config.max_records {
                self.evict_oldest(now, &mut out);
            }
            self.records.insert(height, RaceRecord::new(height, now));
        }

        let Some(record) = self.records.get_mut(&height) else {
            return out;
        };

        if !record.mark(kind) {
            out.push(Emission::Duplicate(kind));
            return out;
        }
        out.push(Emission::Accepted(kind));
        first_arrival(record, event, tie_policy, &mut out);

        if record.is_complete() {
            self.retire(height, now);
        }

        out
    }

    /// Retire records older than `max_age` and forget old retired heights.
    pub fn sweep(&mut self, now: Instant) -> Vec<Emission> {
        let mut out = Vec::new();

        let mut expired: Vec<(Instant, u64)> = self
            .records
            .values()
            .filter(|r| r.age(now) >= self.config.max_age)
            .map(|r| (r.created_at, r.height))
            .collect();
        expired.sort_unstable();

        for (_, height) in expired {
            if let Some(record) = self.records.remove(&height) {
                out.push(Emission::Evicted(EvictReason::Age));
                if record.is_abandoned_race() {
                    out.push(Emission::Abandoned { height });
                }
                self.remember_retired(height, None, now);
            }
        }

        self.prune_retired(now);
        out
    }

    fn evict_oldest(&mut self, now: Instant, out: &mut Vec<Emission>) {
        let Some(height) = self
            .records
            .values()
            .min_by_key(|r| (r.created_at, r.height))
            .map(|r| r.height)
        else {
            return;
        };

        if let Some(record) = self.records.remove(&height) {
            out.push(Emission::Evicted(EvictReason::Capacity));
            if record.is_abandoned_race() {
                out.push(Emission::Abandoned { height });
            }
            self.remember_retired(height, None, now);
        }
    }

    fn retire(&mut self, height: u64, now: Instant) {
        if let Some(record) = self.records.remove(&height) {
            self.remember_retired(height, Some(record), now);
        }
    }

    fn remember_retired(&mut self, height: u64, completed: Option<RaceRecord>, now: Instant) {
        if self.retired.insert(height, Retired { completed }).is_none() {
            self.retired_order.push_back((height, now));
        }
        while self.retired_order.len() > self.config.max_records {
            if let Some((old, _)) = self.retired_order.pop_front() {
                self.retired.remove(&old);
            }
        }
    }

    fn prune_retired(&mut self, now: Instant) {
        while let Some(&(height, at)) = self.retired_order.front() {
            if now.saturating_duration_since(at) < self.config.retired_retention {
                break;
            }
            self.retired_order.pop_front();
            self.retired.remove(&height);
        }
    }
}

/// Emissions for the first event of its kind at a height.
fn first_arrival(
    record: &mut RaceRecord,
    event: &DomainEvent,
    tie_policy: TiePolicy,
    out: &mut Vec<Emission>,
) {
    let height = record.height;
    match event {
        DomainEvent::Reconstructed(r) => out.push(Emission::Reconstructed {
            height,
            duration: r.duration,
            chunks_used: r.chunks_used,
            chunks_received: r.chunks_received,
        }),
        DomainEvent::SendStart { .. } => out.push(Emission::SendStart { height }),
        DomainEvent::RaceWinner(w) => {
            out.push(Emission::Delivery {
                height,
                mechanism: w.mechanism,
                peer: w.peer.clone(),
            });
            apply_explicit_winner(record, w.mechanism, out);
        }
        DomainEvent::RaceTiming(t) => apply_timing(record, t, tie_policy, out),
        DomainEvent::BlockConnected(c) => out.push(Emission::Connected {
            height,
            tx_count: c.tx_count,
            duration: c.connection_duration,
        }),
    }
}

fn apply_explicit_winner(record: &mut RaceRecord, mechanism: Mechanism, out: &mut Vec<Emission>) {
    match record.outcome {
        None => {
            let outcome = RaceOutcome::Winner {
                mechanism,
                source: ResolutionSource::Explicit,
                margin: None,
            };
            record.outcome = Some(outcome);
            out.push(Emission::RaceResolved {
                height: record.height,
                outcome,
            });
        }
        Some(RaceOutcome::Winner {
            mechanism: by_latency,
            source: ResolutionSource::Latency,
            ..
        }) if by_latency != mechanism => out.push(Emission::WinnerMismatch {
            height: record.height,
            explicit: mechanism,
            by_latency,
        }),
        Some(_) => {}
    }
}

fn apply_timing(
    record: &mut RaceRecord,
    timing: &RaceTiming,
    tie_policy: TiePolicy,
    out: &mut Vec<Emission>,
) {
    for mechanism in Mechanism::all() {
        if let Some(latency) = timing.latency(mechanism) {
            out.push(Emission::RaceLatency { mechanism, latency });
        }
    }

    // A partial timing carries no comparison and leaves the race open.
    let (Some(fast), Some(slow)) = (timing.fast_path_latency, timing.slow_path_latency) else {
        return;
    };
    let margin = if fast > slow { fast - slow } else { slow - fast };
    out.push(Emission::RaceMargin(margin));

    let by_latency = match fast.cmp(&slow) {
        Ordering::Less => Some(Mechanism::Fast),
        Ordering::Greater => Some(Mechanism::Slow),
        Ordering::Equal => None,
    };

    match record.outcome {
        None => {
            let outcome = latency_outcome(by_latency, fast, margin, tie_policy);
            record.outcome = Some(outcome);
            out.push(Emission::RaceResolved {
                height: record.height,
                outcome,
            });
        }
        Some(RaceOutcome::Winner {
            mechanism: explicit,
            source: ResolutionSource::Explicit,
            ..
        }) => {
            // The explicit winner stays authoritative; only the margin is filled in.
            record.outcome = Some(RaceOutcome::Winner {
                mechanism: explicit,
                source: ResolutionSource::Explicit,
                margin: Some(margin),
            });
            if let Some(by_latency) = by_latency.filter(|m| *m != explicit) {
                out.push(Emission::WinnerMismatch {
                    height: record.height,
                    explicit,
                    by_latency,
                });
            }
        }
        Some(_) => {}
    }
}

fn latency_outcome(
    by_latency: Option<Mechanism>,
    latency: Duration,
    margin: Duration,
    tie_policy: TiePolicy,
) -> RaceOutcome {
    let winner = |mechanism| RaceOutcome::Winner {
        mechanism,
        source: ResolutionSource::Latency,
        margin: Some(margin),
    };
    match (by_latency, tie_policy) {
        (Some(mechanism), _) => winner(mechanism),
        (None, TiePolicy::Record) => RaceOutcome::Tie { latency },
        (None, TiePolicy::PreferFast) => winner(Mechanism::Fast),
        (None, TiePolicy::PreferSlow) => winner(Mechanism::Slow),
    }
}
