use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::metrics::{Aggregator, FibreMetrics};
use crate::probe::parse::{decode, split_record, DecodeError};
use crate::probe::stats::EventStats;
use crate::probe::RawEvent;
use crate::race::{Correlator, CorrelatorConfig};

/// Single-writer event path: normalizer, correlator, aggregator.
///
/// Owns the correlator outright, so no locking is needed between stages.
pub struct Pipeline {
    correlator: Correlator,
    aggregator: Aggregator,
    stats: Arc<EventStats>,
}

impl Pipeline {
    pub fn new(
        config: CorrelatorConfig,
        metrics: Arc<FibreMetrics>,
        stats: Arc<EventStats>,
        verbose: bool,
    ) -> Self {
        Self {
            correlator: Correlator::new(config),
            aggregator: Aggregator::new(metrics, verbose),
            stats,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Normalize and correlate one record. Rejected records are counted
    /// under their error label and otherwise dropped.
    pub fn process(&mut self, raw: &RawEvent, now: Instant) -> Result<(), DecodeError> {
        let timed = match decode(raw) {
            Ok(timed) => timed,
            Err(e) => {
                self.reject(&e, raw.probe_id);
                return Err(e);
            }
        };

        self.stats.record(timed.event.kind());
        let emissions = self.correlator.apply(&timed.event, now);
        self.aggregator.apply(&emissions, self.correlator.len());
        Ok(())
    }

    /// Split and process a raw ring buffer sample.
    pub fn process_bytes(&mut self, data: &[u8], now: Instant) -> Result<(), DecodeError> {
        match split_record(data) {
            Ok(raw) => self.process(&raw, now),
            Err(e) => {
                self.reject(&e, 0);
                Err(e)
            }
        }
    }

    /// Retire aged records.
    pub fn sweep(&mut self, now: Instant) {
        let emissions = self.correlator.sweep(now);
        if !emissions.is_empty() {
            debug!(count = emissions.len(), "race records swept");
        }
        self.aggregator.apply(&emissions, self.correlator.len());
    }

    /// Count records the source lost before they reached the pipeline.
    pub fn record_source_losses(&self, dropped: u64, truncated: u64) {
        let metrics = self.aggregator.metrics();
        if dropped > 0 {
            warn!(dropped, "event channel full, records dropped");
            metrics.record_errors("channel_full", dropped);
        }
        if truncated > 0 {
            metrics.record_errors("truncated", truncated);
        }
    }

    fn reject(&self, e: &DecodeError, probe_id: u8) {
        self.stats.record_rejected();
        self.aggregator.metrics().record_error(e.label());
        debug!(error = %e, probe_id, "event rejected");
    }
}
