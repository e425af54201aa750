//! Metrics aggregator.
//!
//! [`FibreMetrics`] owns the Prometheus registry and every metric the
//! exporter publishes. [`Aggregator`] is the single writer: it maps
//! correlator [`Emission`]s onto those metrics under a write barrier, and
//! scrapes encode under the matching read barrier, so a scrape never sees
//! half of a batch.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};

use crate::probe::event::{EventKind, Mechanism};
use crate::race::{Emission, EvictReason, RaceOutcome};

/// Reconstruction and connection duration buckets, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

const CHUNK_BUCKETS: &[f64] = &[
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
];

const TX_COUNT_BUCKETS: &[f64] = &[
    1.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 3000.0, 5000.0, 10000.0,
];

/// Race margin buckets, in seconds.
const MARGIN_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Every metric the exporter publishes.
pub struct FibreMetrics {
    registry: Registry,
    /// Held for writing while a batch is applied, for reading while encoding.
    barrier: RwLock<()>,

    // === Fast-path reconstruction ===
    pub blocks_reconstructed: Counter,
    pub reconstruction_duration: Histogram,
    pub chunks_used: Histogram,
    pub chunks_received_total: Counter,
    pub chunks_used_total: Counter,
    pub blocks_sent: Counter,

    // === Delivery and chain connection ===
    pub block_deliveries: CounterVec,
    pub last_block_height: Gauge,
    pub blocks_connected: Counter,
    pub connection_duration: Histogram,
    pub tx_count: Histogram,

    // === Race outcomes ===
    pub race_wins: CounterVec,
    pub race_ties: Counter,
    pub race_margin: Histogram,
    pub race_latency: HistogramVec,
    pub races_abandoned: Counter,
    pub records_evicted: CounterVec,
    pub records_inflight: Gauge,
    pub duplicate_events: CounterVec,
    pub late_events: CounterVec,

    // === Exporter self-observability ===
    pub exporter_up: Gauge,
    pub exporter_start_time: Gauge,
    pub probes_attached: Gauge,
    pub probes_total: Gauge,
    pub events_processed: CounterVec,
    pub errors: CounterVec,
    pub exporter_info: GaugeVec,
}

impl FibreMetrics {
    /// Creates every metric under `prefix`, block metrics labelled with `node`.
    pub fn new(prefix: &str, node: &str) -> Result<Self> {
        let registry = Registry::new();

        let opts = |name: &str, help: &str| {
            Opts::new(name, help)
                .namespace(prefix)
                .const_label("node", node)
        };
        let hist = |name: &str, help: &str, buckets: &[f64]| {
            HistogramOpts::new(name, help)
                .namespace(prefix)
                .const_label("node", node)
                .buckets(buckets.to_vec())
        };
        let plain = |name: &str, help: &str| Opts::new(name, help).namespace(prefix);

        let blocks_reconstructed = Counter::with_opts(opts(
            "blocks_reconstructed_total",
            "Total blocks reconstructed from FIBRE chunks.",
        ))?;
        let reconstruction_duration = Histogram::with_opts(hist(
            "block_reconstruction_duration_seconds",
            "Time to reconstruct a block from FIBRE chunks.",
            DURATION_BUCKETS,
        ))?;
        let chunks_used = Histogram::with_opts(hist(
            "block_chunks_used",
            "Chunks used per block reconstruction.",
            CHUNK_BUCKETS,
        ))?;
        let chunks_received_total = Counter::with_opts(opts(
            "chunks_received_total",
            "Total FIBRE chunks received.",
        ))?;
        let chunks_used_total = Counter::with_opts(opts(
            "chunks_used_total",
            "Total FIBRE chunks used for reconstruction.",
        ))?;
        let blocks_sent = Counter::with_opts(opts(
            "blocks_sent_total",
            "Total blocks sent via FIBRE.",
        ))?;

        let block_deliveries = CounterVec::new(
            opts(
                "block_deliveries_total",
                "Block deliveries by winning mechanism and peer.",
            ),
            &["mechanism", "peer"],
        )?;
        let last_block_height = Gauge::with_opts(opts(
            "last_block_height",
            "Highest block height observed.",
        ))?;
        let blocks_connected = Counter::with_opts(opts(
            "blocks_connected_total",
            "Total blocks connected to the chain.",
        ))?;
        let connection_duration = Histogram::with_opts(hist(
            "block_connection_duration_seconds",
            "Time to validate and connect a block.",
            DURATION_BUCKETS,
        ))?;
        let tx_count = Histogram::with_opts(hist(
            "block_tx_count",
            "Transactions per connected block.",
            TX_COUNT_BUCKETS,
        ))?;

        let race_wins = CounterVec::new(
            opts(
                "race_wins_total",
                "Block races won by mechanism and resolution source.",
            ),
            &["mechanism", "source"],
        )?;
        let race_ties = Counter::with_opts(opts(
            "race_ties_total",
            "Block races where both mechanisms had identical latency.",
        ))?;
        let race_margin = Histogram::with_opts(hist(
            "race_margin_seconds",
            "Latency difference between the two mechanisms.",
            MARGIN_BUCKETS,
        ))?;
        let race_latency = HistogramVec::new(
            hist(
                "race_latency_seconds",
                "Per-mechanism block delivery latency.",
                DURATION_BUCKETS,
            ),
            &["mechanism"],
        )?;
        let races_abandoned = Counter::with_opts(opts(
            "races_abandoned_total",
            "Races retired without a determinable outcome.",
        ))?;
        let records_evicted = CounterVec::new(
            opts(
                "race_records_evicted_total",
                "Race records retired before completing, by reason.",
            ),
            &["reason"],
        )?;
        let records_inflight = Gauge::with_opts(opts(
            "race_records_inflight",
            "Race records currently held by the correlator.",
        ))?;
        let duplicate_events = CounterVec::new(
            opts(
                "duplicate_events_total",
                "Events repeated for a height that already saw them.",
            ),
            &["event_type"],
        )?;
        let late_events = CounterVec::new(
            opts(
                "late_events_total",
                "Events dropped because their height was already retired.",
            ),
            &["event_type"],
        )?;

        let exporter_up = Gauge::with_opts(plain(
            "exporter_up",
            "Whether the FIBRE exporter is running (1 = up, 0 = down).",
        ))?;
        let exporter_start_time = Gauge::with_opts(plain(
            "exporter_start_time_seconds",
            "Unix timestamp when the exporter started.",
        ))?;
        let probes_attached = Gauge::with_opts(plain(
            "exporter_probes_attached",
            "Number of USDT probes successfully attached.",
        ))?;
        let probes_total = Gauge::with_opts(plain(
            "exporter_probes_total",
            "Number of USDT probes the exporter tried to attach.",
        ))?;
        let events_processed = CounterVec::new(
            plain(
                "exporter_events_processed_total",
                "Total number of events processed by the exporter.",
            ),
            &["event_type"],
        )?;
        let errors = CounterVec::new(
            plain(
                "exporter_errors_total",
                "Total number of errors encountered by the exporter.",
            ),
            &["error_type"],
        )?;
        let exporter_info = GaugeVec::new(
            plain("exporter_info", "Information about the FIBRE exporter."),
            &["version", "node_name", "bitcoind_path"],
        )?;

        registry.register(Box::new(blocks_reconstructed.clone()))?;
        registry.register(Box::new(reconstruction_duration.clone()))?;
        registry.register(Box::new(chunks_used.clone()))?;
        registry.register(Box::new(chunks_received_total.clone()))?;
        registry.register(Box::new(chunks_used_total.clone()))?;
        registry.register(Box::new(blocks_sent.clone()))?;
        registry.register(Box::new(block_deliveries.clone()))?;
        registry.register(Box::new(last_block_height.clone()))?;
        registry.register(Box::new(blocks_connected.clone()))?;
        registry.register(Box::new(connection_duration.clone()))?;
        registry.register(Box::new(tx_count.clone()))?;
        registry.register(Box::new(race_wins.clone()))?;
        registry.register(Box::new(race_ties.clone()))?;
        registry.register(Box::new(race_margin.clone()))?;
        registry.register(Box::new(race_latency.clone()))?;
        registry.register(Box::new(races_abandoned.clone()))?;
        registry.register(Box::new(records_evicted.clone()))?;
        registry.register(Box::new(records_inflight.clone()))?;
        registry.register(Box::new(duplicate_events.clone()))?;
        registry.register(Box::new(late_events.clone()))?;
        registry.register(Box::new(exporter_up.clone()))?;
        registry.register(Box::new(exporter_start_time.clone()))?;
        registry.register(Box::new(probes_attached.clone()))?;
        registry.register(Box::new(probes_total.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(exporter_info.clone()))?;

        Ok(Self {
            registry,
            barrier: RwLock::new(()),
            blocks_reconstructed,
            reconstruction_duration,
            chunks_used,
            chunks_received_total,
            chunks_used_total,
            blocks_sent,
            block_deliveries,
            last_block_height,
            blocks_connected,
            connection_duration,
            tx_count,
            race_wins,
            race_ties,
            race_margin,
            race_latency,
            races_abandoned,
            records_evicted,
            records_inflight,
            duplicate_events,
            late_events,
            exporter_up,
            exporter_start_time,
            probes_attached,
            probes_total,
            events_processed,
            errors,
            exporter_info,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode a consistent snapshot in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let families = {
            let _read = self.barrier.read();
            self.registry.gather()
        };

        let mut buffer = Vec::with_capacity(8 * 1024);
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .context("encoding metrics")?;
        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Publish the static exporter info and start time.
    pub fn set_info(&self, version: &str, node_name: &str, bitcoind_path: &str, started: SystemTime) {
        self.exporter_info
            .with_label_values(&[version, node_name, bitcoind_path])
            .set(1.0);
        let since_epoch = started
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        self.exporter_start_time.set(since_epoch.as_secs_f64());
    }

    pub fn set_probes(&self, attached: usize, total: usize) {
        self.probes_attached.set(attached as f64);
        self.probes_total.set(total as f64);
    }

    pub fn set_up(&self, up: bool) {
        self.exporter_up.set(if up { 1.0 } else { 0.0 });
    }

    /// Count an error by its stable label.
    pub fn record_error(&self, error_type: &str) {
        self.errors.with_label_values(&[error_type]).inc();
    }

    pub fn record_errors(&self, error_type: &str, n: u64) {
        if n > 0 {
            self.errors.with_label_values(&[error_type]).inc_by(n as f64);
        }
    }
}

macro_rules! event_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// Single writer that folds correlator output into [`FibreMetrics`].
pub struct Aggregator {
    metrics: Arc<FibreMetrics>,
    last_height: Option<u64>,
    verbose: bool,
}

impl Aggregator {
    pub fn new(metrics: Arc<FibreMetrics>, verbose: bool) -> Self {
        Self {
            metrics,
            last_height: None,
            verbose,
        }
    }

    pub fn metrics(&self) -> &Arc<FibreMetrics> {
        &self.metrics
    }

    /// Highest height recorded in the `last_block_height` gauge.
    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Apply one batch of emissions atomically with respect to scrapes.
    pub fn apply(&mut self, emissions: &[Emission], inflight: usize) {
        let metrics = Arc::clone(&self.metrics);
        let _write = metrics.barrier.write();

        for emission in emissions {
            self.apply_one(emission);
        }
        metrics.records_inflight.set(inflight as f64);
    }

    fn apply_one(&mut self, emission: &Emission) {
        let m = &*self.metrics;
        let verbose = self.verbose;

        match emission {
            Emission::Accepted(kind) => {
                m.events_processed.with_label_values(&[kind.as_str()]).inc();
            }
            Emission::Reconstructed {
                height,
                duration,
                chunks_used,
                chunks_received,
            } => {
                m.blocks_reconstructed.inc();
                m.reconstruction_duration.observe(duration.as_secs_f64());
                m.chunks_used.observe(f64::from(*chunks_used));
                m.chunks_used_total.inc_by(f64::from(*chunks_used));
                m.chunks_received_total.inc_by(f64::from(*chunks_received));
                event_log!(
                    verbose,
                    height,
                    duration_ms = duration.as_secs_f64() * 1000.0,
                    chunks_used,
                    chunks_received,
                    "block reconstructed"
                );
            }
            Emission::SendStart { height } => {
                m.blocks_sent.inc();
                event_log!(verbose, height, "block send started");
            }
            Emission::Delivery {
                height,
                mechanism,
                peer,
            } => {
                m.block_deliveries
                    .with_label_values(&[mechanism.as_str(), peer.as_str()])
                    .inc();
                self.observe_height(*height);
                event_log!(verbose, height, %mechanism, peer = %peer, "block delivery");
            }
            Emission::Connected {
                height,
                tx_count,
                duration,
            } => {
                m.blocks_connected.inc();
                // Zero means the probe did not report a value.
                if !duration.is_zero() {
                    m.connection_duration.observe(duration.as_secs_f64());
                }
                if *tx_count > 0 {
                    m.tx_count.observe(*tx_count as f64);
                }
                self.observe_height(*height);
                event_log!(
                    verbose,
                    height,
                    tx_count,
                    connection_ms = duration.as_secs_f64() * 1000.0,
                    "block connected"
                );
            }
            Emission::RaceLatency { mechanism, latency } => {
                m.race_latency
                    .with_label_values(&[mechanism.as_str()])
                    .observe(latency.as_secs_f64());
            }
            Emission::RaceMargin(margin) => {
                m.race_margin.observe(margin.as_secs_f64());
            }
            Emission::RaceResolved { height, outcome } => match outcome {
                RaceOutcome::Winner {
                    mechanism,
                    source,
                    margin,
                } => {
                    m.race_wins
                        .with_label_values(&[mechanism.as_str(), source.as_str()])
                        .inc();
                    event_log!(
                        verbose,
                        height,
                        %mechanism,
                        source = source.as_str(),
                        margin_ms = margin.map(|d| d.as_secs_f64() * 1000.0),
                        "race resolved"
                    );
                }
                RaceOutcome::Tie { latency } => {
                    m.race_ties.inc();
                    event_log!(
                        verbose,
                        height,
                        latency_ms = latency.as_secs_f64() * 1000.0,
                        "race tied"
                    );
                }
            },
            Emission::WinnerMismatch {
                height,
                explicit,
                by_latency,
            } => {
                m.record_error("winner_mismatch");
                tracing::warn!(
                    height,
                    explicit = %explicit,
                    by_latency = %by_latency,
                    "race winner disagrees with reported latencies"
                );
            }
            Emission::Duplicate(kind) => {
                m.duplicate_events.with_label_values(&[kind.as_str()]).inc();
            }
            Emission::Late(kind) => {
                m.late_events.with_label_values(&[kind.as_str()]).inc();
            }
            Emission::Abandoned { height } => {
                m.races_abandoned.inc();
                tracing::debug!(height, "race abandoned without outcome");
            }
            Emission::Evicted(reason) => {
                m.records_evicted
                    .with_label_values(&[reason.as_str()])
                    .inc();
            }
        }
    }

    /// Raise `last_block_height`; lower heights are ignored.
    fn observe_height(&mut self, height: u64) {
        if self.last_height.is_some_and(|h| h >= height) {
            return;
        }
        self.last_height = Some(height);
        self.metrics.last_block_height.set(height as f64);
    }
}

/// Pre-create label sets so every series is visible from the first scrape.
pub fn init_label_sets(metrics: &FibreMetrics) {
    for kind in EventKind::all() {
        metrics.events_processed.with_label_values(&[kind.as_str()]);
    }
    for mechanism in Mechanism::all() {
        metrics.race_latency.with_label_values(&[mechanism.as_str()]);
    }
    for reason in [EvictReason::Age, EvictReason::Capacity] {
        metrics.records_evicted.with_label_values(&[reason.as_str()]);
    }
}
