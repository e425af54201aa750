use std::fmt;
use std::time::Duration;

/// ProbeId identifies the USDT probe that produced a raw record.
/// Values must match `bpf/fibre.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProbeId {
    BlockReconstructed = 1,
    BlockSendStart = 2,
    BlockRaceWinner = 3,
    BlockRaceTiming = 4,
    BlockConnected = 10,
}

impl ProbeId {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BlockReconstructed => "block_reconstructed",
            Self::BlockSendStart => "block_send_start",
            Self::BlockRaceWinner => "block_race_winner",
            Self::BlockRaceTiming => "block_race_timing",
            Self::BlockConnected => "block_connected",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::BlockReconstructed),
            2 => Some(Self::BlockSendStart),
            3 => Some(Self::BlockRaceWinner),
            4 => Some(Self::BlockRaceTiming),
            10 => Some(Self::BlockConnected),
            _ => None,
        }
    }

    /// Return all probe ids in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::BlockReconstructed,
            Self::BlockSendStart,
            Self::BlockRaceWinner,
            Self::BlockRaceTiming,
            Self::BlockConnected,
        ]
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block delivery mechanism competing in a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// FIBRE over UDP.
    Fast,
    /// BIP152 compact blocks over the regular P2P network.
    Slow,
}

impl Mechanism {
    /// Returns the canonical metric label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fibre_udp",
            Self::Slow => "bip152_cmpct",
        }
    }

    /// Decodes the winner string reported by the race-winner probe.
    ///
    /// bitcoind reports "FIBRE" for the fast path and "BIP152" for compact
    /// blocks; only the leading byte is significant.
    pub fn from_winner(s: &str) -> Option<Self> {
        match s.as_bytes().first() {
            Some(b'F') => Some(Self::Fast),
            Some(b'B') => Some(Self::Slow),
            _ => None,
        }
    }

    pub const fn all() -> [Self; 2] {
        [Self::Fast, Self::Slow]
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a [`DomainEvent`], used for per-kind counters and duplicate tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Reconstructed = 0,
    SendStart = 1,
    RaceWinner = 2,
    RaceTiming = 3,
    BlockConnected = 4,
}

/// Number of EventKind variants, used for array sizing.
pub const EVENT_KIND_CARDINALITY: usize = 5;

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reconstructed => "block_reconstructed",
            Self::SendStart => "block_send_start",
            Self::RaceWinner => "block_race_winner",
            Self::RaceTiming => "block_race_timing",
            Self::BlockConnected => "block_connected",
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::Reconstructed),
            1 => Some(Self::SendStart),
            2 => Some(Self::RaceWinner),
            3 => Some(Self::RaceTiming),
            4 => Some(Self::BlockConnected),
            _ => None,
        }
    }

    pub const fn all() -> [Self; EVENT_KIND_CARDINALITY] {
        [
            Self::Reconstructed,
            Self::SendStart,
            Self::RaceWinner,
            Self::RaceTiming,
            Self::BlockConnected,
        ]
    }

    /// Bit used in a record's seen-kinds mask.
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// Whether this kind takes part in the fast/slow race.
    pub const fn is_race_event(self) -> bool {
        !matches!(self, Self::BlockConnected)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fast-path block fully rebuilt locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstructed {
    pub height: u64,
    pub duration: Duration,
    pub chunks_used: u32,
    pub chunks_received: u32,
    pub num_peers: u32,
}

/// Authoritative signal of which mechanism first delivered a usable block.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceWinner {
    pub height: u64,
    pub mechanism: Mechanism,
    pub peer: String,
}

/// Both latencies observed for a height; `None` means that mechanism never
/// completed.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceTiming {
    pub height: u64,
    pub fast_path_latency: Option<Duration>,
    pub slow_path_latency: Option<Duration>,
}

impl RaceTiming {
    pub fn latency(&self, mechanism: Mechanism) -> Option<Duration> {
        match mechanism {
            Mechanism::Fast => self.fast_path_latency,
            Mechanism::Slow => self.slow_path_latency,
        }
    }
}

/// Block validated and added to the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockConnected {
    pub height: u64,
    pub tx_count: u64,
    pub connection_duration: Duration,
}

/// Validated domain event decoded from a raw probe record.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    Reconstructed(Reconstructed),
    SendStart { height: u64 },
    RaceWinner(RaceWinner),
    RaceTiming(RaceTiming),
    BlockConnected(BlockConnected),
}

impl DomainEvent {
    /// Block height, the primary correlation key.
    pub fn height(&self) -> u64 {
        match self {
            Self::Reconstructed(e) => e.height,
            Self::SendStart { height } => *height,
            Self::RaceWinner(e) => e.height,
            Self::RaceTiming(e) => e.height,
            Self::BlockConnected(e) => e.height,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::Reconstructed(_) => EventKind::Reconstructed,
            Self::SendStart { .. } => EventKind::SendStart,
            Self::RaceWinner(_) => EventKind::RaceWinner,
            Self::RaceTiming(_) => EventKind::RaceTiming,
            Self::BlockConnected(_) => EventKind::BlockConnected,
        }
    }
}

/// A decoded event together with its capture timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedEvent {
    /// Monotonic kernel timestamp (`bpf_ktime_get_ns`).
    pub timestamp_ns: u64,
    pub event: DomainEvent,
}
