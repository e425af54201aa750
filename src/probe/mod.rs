pub mod event;
pub mod parse;
pub mod semaphore;
pub mod stats;
pub mod usdt;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use self::event::ProbeId;

/// Opaque record as delivered by the tracing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Monotonic capture timestamp (`bpf_ktime_get_ns`).
    pub timestamp_ns: u64,
    /// Raw probe identifier, validated by the normalizer.
    pub probe_id: u8,
    /// Number of USDT arguments the probe actually read.
    pub arg_count: u8,
    /// Argument slots followed by the two string slots.
    pub payload: Vec<u8>,
}

/// Static description of one USDT probe in the target binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDef {
    pub id: ProbeId,
    pub provider: &'static str,
    pub name: &'static str,
    /// 1-based argument indices that are `char *` and copied into the
    /// record's string slots, in slot order.
    pub string_args: &'static [u8],
}

impl ProbeDef {
    /// `provider:name` form used in logs.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.provider, self.name)
    }
}

/// Every probe the exporter knows about.
pub const PROBES: &[ProbeDef] = &[
    ProbeDef {
        id: ProbeId::BlockReconstructed,
        provider: "udp",
        name: "block_reconstructed",
        string_args: &[],
    },
    ProbeDef {
        id: ProbeId::BlockSendStart,
        provider: "udp",
        name: "block_send_start",
        string_args: &[],
    },
    ProbeDef {
        id: ProbeId::BlockRaceWinner,
        provider: "udp",
        name: "block_race_winner",
        string_args: &[3, 4],
    },
    ProbeDef {
        id: ProbeId::BlockRaceTiming,
        provider: "udp",
        name: "block_race_timing",
        string_args: &[],
    },
    ProbeDef {
        id: ProbeId::BlockConnected,
        provider: "validation",
        name: "block_connected",
        string_args: &[],
    },
];

/// Look up a probe definition by provider and name.
pub fn find_probe(provider: &str, name: &str) -> Option<&'static ProbeDef> {
    PROBES
        .iter()
        .find(|p| p.provider == provider && p.name == name)
}

/// Outcome of attaching the probe set to a target process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachReport {
    pub attached: Vec<ProbeId>,
    /// Probes that could not be attached, with the reason.
    pub skipped: Vec<(ProbeId, String)>,
}

impl AttachReport {
    pub fn attached_count(&self) -> usize {
        self.attached.len()
    }

    pub fn total(&self) -> usize {
        self.attached.len() + self.skipped.len()
    }
}

/// Producer side of the raw event channel.
///
/// Sources push without blocking; records that do not fit are counted
/// and later surfaced by the pipeline as `channel_full` errors. Samples
/// too short to carry a header are counted as `truncated`.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<RawEvent>,
    dropped: Arc<AtomicU64>,
    truncated: Arc<AtomicU64>,
}

impl EventSink {
    /// Create a bounded channel of the given capacity.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                truncated: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Push a record without waiting. Returns false once the receiver is gone.
    pub fn try_push(&self, event: RawEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Count a sample that could not be split into a [`RawEvent`].
    pub fn record_truncated(&self) {
        self.truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the number of records dropped on a full channel.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Read and reset the number of truncated samples.
    pub fn take_truncated(&self) -> u64 {
        self.truncated.swap(0, Ordering::Relaxed)
    }
}

/// ProbeSource attaches to the target's USDT probes and streams raw records.
pub trait ProbeSource: Send {
    /// Attach every known probe independently. Probes missing from the
    /// binary are reported as skipped; insufficient privilege is an error.
    fn attach(&mut self) -> impl std::future::Future<Output = Result<AttachReport>> + Send;

    /// Start streaming records into `sink` until `ctx` is cancelled.
    fn start(
        &mut self,
        ctx: CancellationToken,
        sink: EventSink,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Detach all probes and release kernel-side resources.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_table_covers_every_id() {
        for id in ProbeId::all() {
            assert_eq!(PROBES.iter().filter(|p| p.id == *id).count(), 1);
        }
        let def = find_probe("udp", "block_race_winner").unwrap();
        assert_eq!(def.id, ProbeId::BlockRaceWinner);
        assert_eq!(def.qualified_name(), "udp:block_race_winner");
        assert!(find_probe("net", "block_race_winner").is_none());
    }

    #[tokio::test]
    async fn test_event_sink_counts_drops() {
        let (sink, mut rx) = EventSink::channel(1);
        let ev = RawEvent {
            timestamp_ns: 1,
            probe_id: 2,
            arg_count: 1,
            payload: vec![0; 8],
        };
        assert!(sink.try_push(ev.clone()));
        assert!(sink.try_push(ev.clone()));
        assert_eq!(sink.take_dropped(), 1);
        assert_eq!(sink.take_dropped(), 0);
        sink.record_truncated();
        assert_eq!(sink.take_truncated(), 1);
        assert_eq!(rx.recv().await, Some(ev.clone()));

        drop(rx);
        assert!(!sink.try_push(ev));
    }
}
