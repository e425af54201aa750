use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fibre_exporter::agent::Pipeline;
use fibre_exporter::config::{Config, Overrides};
use fibre_exporter::metrics::FibreMetrics;
use fibre_exporter::probe::event::ProbeId;
use fibre_exporter::probe::stats::EventStats;
use fibre_exporter::race::{CorrelatorConfig, RaceState, TiePolicy};

const HASH: i64 = 0x7fff_5000_1000;
const MAX_ARGS: usize = 6;
const STR_SIZE: usize = 64;

fn record(probe: ProbeId, args: &[i64], s0: &str, s1: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(16 + MAX_ARGS * 8 + 2 * STR_SIZE);
    data.extend_from_slice(&987_654_321u64.to_le_bytes());
    data.push(probe as u8);
    data.push(args.len() as u8);
    data.extend_from_slice(&[0u8; 6]);

    let mut slots = [0i64; MAX_ARGS];
    slots[..args.len()].copy_from_slice(args);
    for v in slots {
        data.extend_from_slice(&v.to_le_bytes());
    }
    for s in [s0, s1] {
        let mut slot = [0u8; STR_SIZE];
        slot[..s.len()].copy_from_slice(s.as_bytes());
        data.extend_from_slice(&slot);
    }
    data
}

fn send_start(height: i64) -> Vec<u8> {
    record(ProbeId::BlockSendStart, &[HASH, height], "", "")
}

fn reconstructed(height: i64, duration: Duration, chunks_used: i64, chunks_received: i64) -> Vec<u8> {
    record(
        ProbeId::BlockReconstructed,
        &[
            HASH,
            height,
            chunks_used,
            chunks_received,
            3,
            duration.as_micros() as i64,
        ],
        "",
        "",
    )
}

fn race_winner(height: i64, winner: &str, peer: &str) -> Vec<u8> {
    record(ProbeId::BlockRaceWinner, &[HASH, height, 0, 0], winner, peer)
}

fn race_timing(height: i64, fast: Option<Duration>, slow: Option<Duration>) -> Vec<u8> {
    let ns = |d: Option<Duration>| d.map_or(-1, |d| d.as_nanos() as i64);
    record(
        ProbeId::BlockRaceTiming,
        &[HASH, height, ns(fast), ns(slow)],
        "",
        "",
    )
}

fn block_connected(height: i64, tx_count: i64, duration: Duration) -> Vec<u8> {
    record(
        ProbeId::BlockConnected,
        &[HASH, height, tx_count, 4000, 9000, duration.as_nanos() as i64],
        "",
        "",
    )
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Harness {
    metrics: Arc<FibreMetrics>,
    pipeline: Pipeline,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(CorrelatorConfig::default())
    }

    fn with_config(config: CorrelatorConfig) -> Self {
        let metrics = Arc::new(FibreMetrics::new("fibre", "test-node").unwrap());
        let pipeline = Pipeline::new(
            config,
            Arc::clone(&metrics),
            Arc::new(EventStats::new()),
            false,
        );
        Self {
            metrics,
            pipeline,
            now: Instant::now(),
        }
    }

    fn feed(&mut self, data: &[u8]) {
        self.pipeline.process_bytes(data, self.now).unwrap();
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        self.pipeline.sweep(self.now);
    }

    fn text(&self) -> String {
        self.metrics.encode().unwrap()
    }

    /// Value of the sample whose name and labels match `series` exactly.
    fn sample(&self, series: &str) -> Option<f64> {
        let text = self.text();
        text.lines()
            .filter(|l| !l.starts_with('#'))
            .find_map(|l| {
                let (name, value) = l.rsplit_once(' ')?;
                (name == series).then(|| value.parse().ok()).flatten()
            })
    }

    fn value(&self, series: &str) -> f64 {
        self.sample(series)
            .unwrap_or_else(|| panic!("series {series} not found in:\n{}", self.text()))
    }
}

#[test]
fn fast_path_delivery_counts_reconstruction_and_send() {
    let mut h = Harness::new();
    h.feed(&send_start(100));
    h.feed(&reconstructed(100, ms(50), 12, 40));
    h.feed(&race_winner(100, "FIBRE", "10.0.0.7:8333"));

    assert_eq!(h.value("fibre_blocks_reconstructed_total{node=\"test-node\"}"), 1.0);
    assert_eq!(h.value("fibre_blocks_sent_total{node=\"test-node\"}"), 1.0);
    assert_eq!(
        h.value("fibre_block_deliveries_total{mechanism=\"fibre_udp\",node=\"test-node\",peer=\"10.0.0.7:8333\"}"),
        1.0
    );
    assert_eq!(
        h.value("fibre_race_wins_total{mechanism=\"fibre_udp\",node=\"test-node\",source=\"explicit\"}"),
        1.0
    );
    assert_eq!(h.value("fibre_block_chunks_used_count{node=\"test-node\"}"), 1.0);
    assert_eq!(h.value("fibre_block_chunks_used_sum{node=\"test-node\"}"), 12.0);
    assert_eq!(h.value("fibre_chunks_received_total{node=\"test-node\"}"), 40.0);
    assert_eq!(
        h.value("fibre_block_reconstruction_duration_seconds_sum{node=\"test-node\"}"),
        0.05
    );
    assert_eq!(h.value("fibre_last_block_height{node=\"test-node\"}"), 100.0);
}

#[test]
fn latency_resolution_records_margin() {
    let mut h = Harness::new();
    h.feed(&race_timing(101, Some(ms(90)), Some(ms(40))));

    assert_eq!(
        h.value("fibre_race_wins_total{mechanism=\"bip152_cmpct\",node=\"test-node\",source=\"latency\"}"),
        1.0
    );
    assert_eq!(h.value("fibre_race_margin_seconds_count{node=\"test-node\"}"), 1.0);
    assert_eq!(h.value("fibre_race_margin_seconds_sum{node=\"test-node\"}"), 0.05);
    assert_eq!(
        h.value("fibre_race_latency_seconds_count{mechanism=\"fibre_udp\",node=\"test-node\"}"),
        1.0
    );
    // No explicit winner, so no delivery.
    assert!(!h.text().contains("fibre_block_deliveries_total{"));
    assert_eq!(h.pipeline.correlator().state(101), RaceState::Resolved);
}

#[test]
fn exact_tie_counts_only_the_tie() {
    let mut h = Harness::new();
    h.feed(&race_timing(102, Some(ms(30)), Some(ms(30))));

    assert_eq!(h.value("fibre_race_ties_total{node=\"test-node\"}"), 1.0);
    assert!(!h.text().contains("fibre_race_wins_total{"));
    assert_eq!(h.value("fibre_race_margin_seconds_sum{node=\"test-node\"}"), 0.0);
}

#[test]
fn tie_policy_can_credit_a_mechanism() {
    let mut h = Harness::with_config(CorrelatorConfig {
        tie_policy: TiePolicy::PreferFast,
        ..Default::default()
    });
    h.feed(&race_timing(102, Some(ms(30)), Some(ms(30))));

    assert_eq!(h.value("fibre_race_ties_total{node=\"test-node\"}"), 0.0);
    assert_eq!(
        h.value("fibre_race_wins_total{mechanism=\"fibre_udp\",node=\"test-node\",source=\"latency\"}"),
        1.0
    );
}

#[test]
fn username_without_password_refuses_to_start() {
    let err = Config::resolve(
        None,
        &Overrides {
            bitcoind_path: Some("/usr/local/bin/bitcoind".into()),
            metrics_auth_username: Some("prometheus".to_string()),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("metrics_auth_password"));
}

#[test]
fn abandoned_race_flushed_once() {
    let mut h = Harness::with_config(CorrelatorConfig {
        max_age: Duration::from_secs(60),
        retired_retention: Duration::from_secs(600),
        ..Default::default()
    });
    h.feed(&send_start(103));

    h.advance(Duration::from_secs(61));
    h.advance(Duration::from_secs(61));

    assert_eq!(h.value("fibre_races_abandoned_total{node=\"test-node\"}"), 1.0);
    assert_eq!(
        h.value("fibre_race_records_evicted_total{node=\"test-node\",reason=\"age\"}"),
        1.0
    );
    assert!(!h.text().contains("fibre_race_wins_total{"));
    assert_eq!(h.value("fibre_race_records_inflight{node=\"test-node\"}"), 0.0);

    // A late winner does not resurrect the record.
    h.feed(&race_winner(103, "FIBRE", "peer"));
    assert_eq!(
        h.value("fibre_late_events_total{event_type=\"block_race_winner\",node=\"test-node\"}"),
        1.0
    );
    assert!(!h.text().contains("fibre_race_wins_total{"));
    assert_eq!(h.value("fibre_races_abandoned_total{node=\"test-node\"}"), 1.0);
    assert_eq!(h.pipeline.correlator().state(103), RaceState::Retired);
}

#[test]
fn resolution_paths_agree() {
    let mut explicit = Harness::new();
    explicit.feed(&race_winner(200, "BIP152", "peer"));

    let mut latency = Harness::new();
    latency.feed(&race_timing(200, Some(ms(80)), Some(ms(20))));

    let by_explicit = explicit.value(
        "fibre_race_wins_total{mechanism=\"bip152_cmpct\",node=\"test-node\",source=\"explicit\"}",
    );
    let by_latency = latency.value(
        "fibre_race_wins_total{mechanism=\"bip152_cmpct\",node=\"test-node\",source=\"latency\"}",
    );
    assert_eq!(by_explicit, 1.0);
    assert_eq!(by_latency, 1.0);

    // Both signals for one height, agreeing: one win, no mismatch.
    let mut both = Harness::new();
    both.feed(&race_winner(201, "BIP152", "peer"));
    both.feed(&race_timing(201, Some(ms(80)), Some(ms(20))));
    assert!(both
        .sample("fibre_exporter_errors_total{error_type=\"winner_mismatch\"}")
        .is_none());
    assert_eq!(both.value("fibre_race_margin_seconds_sum{node=\"test-node\"}"), 0.06);
}

#[test]
fn disagreeing_signals_are_counted() {
    let mut h = Harness::new();
    h.feed(&race_timing(300, Some(ms(80)), Some(ms(20))));
    h.feed(&race_winner(300, "FIBRE", "peer"));

    assert_eq!(
        h.value("fibre_exporter_errors_total{error_type=\"winner_mismatch\"}"),
        1.0
    );
    // The first resolution stands.
    assert_eq!(
        h.value("fibre_race_wins_total{mechanism=\"bip152_cmpct\",node=\"test-node\",source=\"latency\"}"),
        1.0
    );
    assert!(h
        .sample("fibre_race_wins_total{mechanism=\"fibre_udp\",node=\"test-node\",source=\"explicit\"}")
        .is_none());
}

#[test]
fn latency_ordering_decides_winner() {
    let cases = [
        (1u64, 2u64, Some("fibre_udp")),
        (2, 1, Some("bip152_cmpct")),
        (5, 5, None),
        (0, 1, Some("fibre_udp")),
    ];

    for (i, (fast, slow, expected)) in cases.into_iter().enumerate() {
        let mut h = Harness::new();
        h.feed(&race_timing(
            400 + i as i64,
            Some(Duration::from_nanos(fast)),
            Some(Duration::from_nanos(slow)),
        ));

        match expected {
            Some(mechanism) => assert_eq!(
                h.value(&format!(
                    "fibre_race_wins_total{{mechanism=\"{mechanism}\",node=\"test-node\",source=\"latency\"}}"
                )),
                1.0,
                "fast={fast} slow={slow}"
            ),
            None => assert_eq!(h.value("fibre_race_ties_total{node=\"test-node\"}"), 1.0),
        }
    }
}

#[test]
fn replaying_an_event_only_counts_a_duplicate() {
    let mut h = Harness::new();
    h.feed(&reconstructed(500, ms(20), 8, 10));
    h.feed(&race_winner(500, "FIBRE", "peer"));

    let before = h.text();
    h.feed(&race_winner(500, "FIBRE", "peer"));
    h.feed(&reconstructed(500, ms(20), 8, 10));
    let after = h.text();

    let samples = |text: &str| -> HashSet<String> {
        text.lines()
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    };
    let (before, after) = (samples(&before), samples(&after));
    assert!(before.difference(&after).next().is_none());
    for line in after.difference(&before) {
        assert!(
            line.starts_with("fibre_duplicate_events_total"),
            "unexpected change: {line}"
        );
    }
    assert_eq!(
        h.value("fibre_duplicate_events_total{event_type=\"block_race_winner\",node=\"test-node\"}"),
        1.0
    );
    assert_eq!(
        h.value("fibre_duplicate_events_total{event_type=\"block_reconstructed\",node=\"test-node\"}"),
        1.0
    );
}

#[test]
fn last_block_height_never_decreases() {
    let mut h = Harness::new();
    h.feed(&block_connected(700, 2500, ms(120)));
    h.feed(&block_connected(650, 1000, ms(80)));
    h.feed(&race_winner(600, "BIP152", "peer"));

    assert_eq!(h.value("fibre_last_block_height{node=\"test-node\"}"), 700.0);
    // Out-of-order heights are still processed.
    assert_eq!(h.value("fibre_blocks_connected_total{node=\"test-node\"}"), 2.0);
    assert_eq!(h.value("fibre_block_tx_count_sum{node=\"test-node\"}"), 3500.0);
}

#[test]
fn connection_is_independent_of_race_state() {
    let mut h = Harness::new();
    h.feed(&block_connected(800, 0, Duration::ZERO));

    assert_eq!(h.value("fibre_blocks_connected_total{node=\"test-node\"}"), 1.0);
    assert_eq!(
        h.value("fibre_block_connection_duration_seconds_count{node=\"test-node\"}"),
        0.0
    );
    assert_eq!(h.value("fibre_block_tx_count_count{node=\"test-node\"}"), 0.0);

    // A connected-only height is not a race and is not abandoned.
    h.advance(Duration::from_secs(31 * 60));
    assert_eq!(h.value("fibre_races_abandoned_total{node=\"test-node\"}"), 0.0);
}

#[test]
fn complete_race_is_retired() {
    let mut h = Harness::new();
    h.feed(&race_winner(900, "FIBRE", "peer"));
    h.feed(&race_timing(900, Some(ms(10)), Some(ms(25))));
    h.feed(&block_connected(900, 3000, ms(150)));

    assert_eq!(h.pipeline.correlator().state(900), RaceState::Retired);
    assert_eq!(h.value("fibre_race_records_inflight{node=\"test-node\"}"), 0.0);
    assert_eq!(h.value("fibre_race_margin_seconds_sum{node=\"test-node\"}"), 0.015);

    // A kind the height never saw is still counted once; a repeat is a duplicate.
    h.feed(&send_start(900));
    h.feed(&send_start(900));
    assert_eq!(h.value("fibre_blocks_sent_total{node=\"test-node\"}"), 1.0);
    assert_eq!(
        h.value("fibre_duplicate_events_total{event_type=\"block_send_start\",node=\"test-node\"}"),
        1.0
    );
    assert!(!h.text().contains("fibre_late_events_total{"));
    assert_eq!(h.pipeline.correlator().state(900), RaceState::Retired);
}

#[test]
fn events_arriving_after_completion_are_counted() {
    let mut h = Harness::new();
    h.feed(&race_timing(950, Some(ms(10)), Some(ms(25))));
    h.feed(&block_connected(950, 2000, ms(90)));
    assert_eq!(h.pipeline.correlator().state(950), RaceState::Retired);

    h.feed(&race_winner(950, "FIBRE", "10.0.0.9:8333"));
    h.feed(&send_start(950));
    h.feed(&reconstructed(950, ms(30), 6, 9));

    assert_eq!(
        h.value("fibre_block_deliveries_total{mechanism=\"fibre_udp\",node=\"test-node\",peer=\"10.0.0.9:8333\"}"),
        1.0
    );
    assert_eq!(h.value("fibre_blocks_sent_total{node=\"test-node\"}"), 1.0);
    assert_eq!(h.value("fibre_blocks_reconstructed_total{node=\"test-node\"}"), 1.0);

    // The latency resolution stays the only counted win.
    assert_eq!(
        h.value("fibre_race_wins_total{mechanism=\"fibre_udp\",node=\"test-node\",source=\"latency\"}"),
        1.0
    );
    assert_eq!(
        h.sample("fibre_race_wins_total{mechanism=\"fibre_udp\",node=\"test-node\",source=\"explicit\"}"),
        None
    );
    assert!(!h.text().contains("fibre_late_events_total{"));
}

#[test]
fn malformed_records_are_counted_not_fatal() {
    let mut h = Harness::new();

    assert!(h.pipeline.process_bytes(&[1, 2, 3], h.now).is_err());
    let mut bad_winner = race_winner(1000, "XYZ", "peer");
    assert!(h.pipeline.process_bytes(&bad_winner, h.now).is_err());
    bad_winner[8] = 77;
    assert!(h.pipeline.process_bytes(&bad_winner, h.now).is_err());
    assert!(h
        .pipeline
        .process_bytes(&race_timing(1001, None, None), h.now)
        .is_err());
    assert!(h
        .pipeline
        .process_bytes(&send_start(-5), h.now)
        .is_err());

    for (label, n) in [
        ("truncated", 1.0),
        ("invalid_mechanism", 1.0),
        ("unknown_probe", 1.0),
        ("empty_race_timing", 1.0),
        ("negative_height", 1.0),
    ] {
        assert_eq!(
            h.value(&format!("fibre_exporter_errors_total{{error_type=\"{label}\"}}")),
            n,
            "{label}"
        );
    }
    assert!(h.pipeline.correlator().is_empty());

    // The pipeline keeps working.
    h.feed(&send_start(1002));
    assert_eq!(h.value("fibre_blocks_sent_total{node=\"test-node\"}"), 1.0);
}

#[test]
fn capacity_eviction_bounds_memory() {
    let mut h = Harness::with_config(CorrelatorConfig {
        max_records: 2,
        ..Default::default()
    });
    h.feed(&send_start(1));
    h.feed(&send_start(2));
    h.feed(&send_start(3));

    assert_eq!(h.pipeline.correlator().len(), 2);
    assert_eq!(
        h.value("fibre_race_records_evicted_total{node=\"test-node\",reason=\"capacity\"}"),
        1.0
    );
    assert_eq!(h.value("fibre_races_abandoned_total{node=\"test-node\"}"), 1.0);
    assert_eq!(h.pipeline.correlator().state(1), RaceState::Retired);
}
