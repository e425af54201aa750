//! Normalizer for raw probe records.
//!
//! Decodes byte records from the ring buffer into typed [`DomainEvent`]
//! values. The record header is validated once, then each probe branch
//! checks its own payload requirement before doing fixed-offset reads.
//! Decoding is pure: no state is kept between records.

use std::time::Duration;

use thiserror::Error;

use super::event::{
    BlockConnected, DomainEvent, Mechanism, ProbeId, RaceTiming, RaceWinner, Reconstructed,
    TimedEvent,
};
use super::RawEvent;

/// Record header size in bytes (matches `struct fibre_event` in fibre.h).
pub const HEADER_SIZE: usize = 16;

/// Number of u64 argument slots in a record.
pub const MAX_ARGS: usize = 6;

/// Size of each fixed string slot.
pub const STR_SIZE: usize = 64;

/// Offset of `str0` within the payload.
pub const STR0_OFFSET: usize = MAX_ARGS * 8;

/// Offset of `str1` within the payload.
pub const STR1_OFFSET: usize = STR0_OFFSET + STR_SIZE;

/// Full payload size in bytes.
pub const PAYLOAD_SIZE: usize = STR1_OFFSET + STR_SIZE;

/// Full record size in bytes.
pub const RECORD_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Peer label used when the probe reports no peer address.
pub const UNKNOWN_PEER: &str = "unknown";

/// Errors that can occur while normalizing a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown probe id: {raw}")]
    UnknownProbe { raw: u8 },

    #[error("reading {probe}: unexpected end of data")]
    PayloadTruncated { probe: ProbeId },

    #[error("reading {probe}: negative block height {height}")]
    NegativeHeight { probe: ProbeId, height: i64 },

    #[error("reading {probe}: negative duration {raw}")]
    NegativeDuration { probe: ProbeId, raw: i64 },

    #[error("reading {probe}: invalid mechanism {raw:?}")]
    InvalidMechanism { probe: ProbeId, raw: String },

    #[error("race timing for height {height} carries no latency")]
    EmptyRaceTiming { height: u64 },
}

impl DecodeError {
    /// Stable label for the `error_type` metric dimension.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownProbe { .. } => "unknown_probe",
            Self::PayloadTruncated { .. } => "payload_truncated",
            Self::NegativeHeight { .. } => "negative_height",
            Self::NegativeDuration { .. } => "negative_duration",
            Self::InvalidMechanism { .. } => "invalid_mechanism",
            Self::EmptyRaceTiming { .. } => "empty_race_timing",
        }
    }
}

/// Split a ring buffer sample into a [`RawEvent`].
///
/// Only the header is validated here; the payload is copied as-is.
pub fn split_record(data: &[u8]) -> Result<RawEvent, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    Ok(RawEvent {
        timestamp_ns: read_u64_le(data, 0),
        probe_id: data[8],
        arg_count: data[9],
        // pad[6] at 10-15
        payload: data[HEADER_SIZE..].to_vec(),
    })
}

/// Decode a ring buffer sample straight into a [`TimedEvent`].
pub fn decode_record(data: &[u8]) -> Result<TimedEvent, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { size: data.len() });
    }

    decode_parts(
        read_u64_le(data, 0),
        data[8],
        data[9],
        &data[HEADER_SIZE..],
    )
}

/// Decode a [`RawEvent`] into a [`TimedEvent`].
pub fn decode(raw: &RawEvent) -> Result<TimedEvent, DecodeError> {
    decode_parts(raw.timestamp_ns, raw.probe_id, raw.arg_count, &raw.payload)
}

fn decode_parts(
    timestamp_ns: u64,
    probe_raw: u8,
    arg_count: u8,
    payload: &[u8],
) -> Result<TimedEvent, DecodeError> {
    let probe = ProbeId::from_u8(probe_raw).ok_or(DecodeError::UnknownProbe { raw: probe_raw })?;
    let args = Args {
        probe,
        data: payload,
        count: arg_count as usize,
    };

    let event = match probe {
        ProbeId::BlockReconstructed => DomainEvent::Reconstructed(parse_reconstructed(&args)?),
        ProbeId::BlockSendStart => DomainEvent::SendStart {
            height: parse_send_start(&args)?,
        },
        ProbeId::BlockRaceWinner => DomainEvent::RaceWinner(parse_race_winner(&args)?),
        ProbeId::BlockRaceTiming => DomainEvent::RaceTiming(parse_race_timing(&args)?),
        ProbeId::BlockConnected => DomainEvent::BlockConnected(parse_block_connected(&args)?),
    };

    Ok(TimedEvent {
        timestamp_ns,
        event,
    })
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Bounds-checked view over the argument slots of one record.
struct Args<'a> {
    probe: ProbeId,
    data: &'a [u8],
    count: usize,
}

impl Args<'_> {
    /// Ensure args `1..=n` and `need` payload bytes are present.
    fn ensure(&self, n: usize, need: usize) -> Result<(), DecodeError> {
        if self.count < n || self.data.len() < need {
            Err(DecodeError::PayloadTruncated { probe: self.probe })
        } else {
            Ok(())
        }
    }

    /// Raw value of 1-based USDT argument `n`.
    fn raw(&self, n: usize) -> u64 {
        read_u64_le(self.data, (n - 1) * 8)
    }

    fn signed(&self, n: usize) -> i64 {
        self.raw(n) as i64
    }

    fn height(&self, n: usize) -> Result<u64, DecodeError> {
        let height = self.signed(n);
        if height < 0 {
            return Err(DecodeError::NegativeHeight {
                probe: self.probe,
                height,
            });
        }
        Ok(height as u64)
    }

    fn duration(&self, n: usize, unit: fn(u64) -> Duration) -> Result<Duration, DecodeError> {
        let raw = self.signed(n);
        if raw < 0 {
            return Err(DecodeError::NegativeDuration {
                probe: self.probe,
                raw,
            });
        }
        Ok(unit(raw as u64))
    }

    fn string(&self, offset: usize) -> String {
        let slot = &self.data[offset..offset + STR_SIZE];
        let end = slot.iter().position(|&b| b == 0).unwrap_or(STR_SIZE);
        String::from_utf8_lossy(&slot[..end]).into_owned()
    }
}

// ---------------------------------------------------------------------------
// Per-probe parsers
// ---------------------------------------------------------------------------

// Every probe passes the block hash pointer as arg 1 and the height as arg 2.

/// udp:block_reconstructed. Args: hash, height, chunks_used, chunks_recvd, num_peers, duration_us.
fn parse_reconstructed(args: &Args<'_>) -> Result<Reconstructed, DecodeError> {
    args.ensure(6, 6 * 8)?;
    Ok(Reconstructed {
        height: args.height(2)?,
        chunks_used: args.raw(3) as u32,
        chunks_received: args.raw(4) as u32,
        num_peers: args.raw(5) as u32,
        duration: args.duration(6, Duration::from_micros)?,
    })
}

/// udp:block_send_start. Args: hash, height.
fn parse_send_start(args: &Args<'_>) -> Result<u64, DecodeError> {
    args.ensure(2, 2 * 8)?;
    args.height(2)
}

/// udp:block_race_winner. Args: hash, height, winner (str0), peer (str1).
fn parse_race_winner(args: &Args<'_>) -> Result<RaceWinner, DecodeError> {
    args.ensure(4, PAYLOAD_SIZE)?;
    let height = args.height(2)?;

    let winner = args.string(STR0_OFFSET);
    let mechanism = Mechanism::from_winner(&winner).ok_or(DecodeError::InvalidMechanism {
        probe: args.probe,
        raw: winner,
    })?;

    let mut peer = args.string(STR1_OFFSET);
    if peer.is_empty() {
        peer = UNKNOWN_PEER.to_string();
    }

    Ok(RaceWinner {
        height,
        mechanism,
        peer,
    })
}

/// udp:block_race_timing. Args: hash, height, udp_ns, cmpct_ns. Negative latency
/// means the mechanism never completed.
fn parse_race_timing(args: &Args<'_>) -> Result<RaceTiming, DecodeError> {
    args.ensure(4, 4 * 8)?;
    let height = args.height(2)?;

    let latency = |n: usize| {
        let raw = args.signed(n);
        (raw >= 0).then(|| Duration::from_nanos(raw as u64))
    };
    let fast_path_latency = latency(3);
    let slow_path_latency = latency(4);

    if fast_path_latency.is_none() && slow_path_latency.is_none() {
        return Err(DecodeError::EmptyRaceTiming { height });
    }

    Ok(RaceTiming {
        height,
        fast_path_latency,
        slow_path_latency,
    })
}

/// validation:block_connected. Args: hash, height, tx_count, inputs, sigops, connection_time_ns.
fn parse_block_connected(args: &Args<'_>) -> Result<BlockConnected, DecodeError> {
    args.ensure(6, 6 * 8)?;
    let tx_count = args.signed(3);
    Ok(BlockConnected {
        height: args.height(2)?,
        tx_count: tx_count.max(0) as u64,
        connection_duration: args.duration(6, Duration::from_nanos)?,
    })
}
