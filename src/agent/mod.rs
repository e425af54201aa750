pub mod pipeline;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::ExpositionServer;
use crate::metrics::{init_label_sets, FibreMetrics};
use crate::pid::ProcFs;
use crate::probe::stats::EventStats;
use crate::probe::{EventSink, ProbeSource, RawEvent};
use crate::version;

pub use self::pipeline::Pipeline;

/// Resolve the target pid: the configured one, or the single process
/// running `bitcoind_path`. The executable is verified either way.
pub fn resolve_pid(cfg: &Config, procfs: &ProcFs) -> Result<u32> {
    let pid = match cfg.pid {
        Some(pid) => pid,
        None => procfs
            .discover(&cfg.bitcoind_path)
            .context("discovering bitcoind process")?,
    };
    procfs
        .verify_binary(pid, &cfg.bitcoind_path)
        .with_context(|| format!("verifying process {pid}"))?;
    Ok(pid)
}

/// Agent orchestrates all components: probe source, pipeline, exposition.
pub struct Agent<S: ProbeSource> {
    cfg: Config,
    pid: u32,
    procfs: ProcFs,
    metrics: Arc<FibreMetrics>,
    server: ExpositionServer,
    source: S,
    stats: Arc<EventStats>,
    cancel: CancellationToken,
    fatal: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: ProbeSource> Agent<S> {
    /// Creates a new Agent for `pid`, registering all metrics.
    pub fn new(cfg: Config, pid: u32, source: S) -> Result<Self> {
        let metrics = Arc::new(
            FibreMetrics::new(&cfg.metrics_prefix, &cfg.node_name).context("creating metrics")?,
        );
        let server = ExpositionServer::new(cfg.server_settings(), Arc::clone(&metrics));

        Ok(Self {
            cfg,
            pid,
            procfs: ProcFs::default(),
            metrics,
            server,
            source,
            stats: Arc::new(EventStats::new()),
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Use a different procfs root for liveness checks.
    pub fn with_procfs(mut self, procfs: ProcFs) -> Self {
        self.procfs = procfs;
        self
    }

    pub fn metrics(&self) -> &Arc<FibreMetrics> {
        &self.metrics
    }

    pub fn server(&self) -> &ExpositionServer {
        &self.server
    }

    /// Cancelled when the agent cannot continue, e.g. the target exited.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start all components and begin observation.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Static exporter metrics.
        init_label_sets(&self.metrics);
        self.metrics.set_info(
            version::RELEASE,
            &self.cfg.node_name,
            &self.cfg.bitcoind_path.display().to_string(),
            SystemTime::now(),
        );

        // 1. Start HTTP listeners so health checks respond during attach.
        self.server
            .start()
            .await
            .context("starting exposition endpoints")?;

        // 2. Attach probes. Each probe is independent; none at all is fatal.
        let report = self
            .source
            .attach()
            .await
            .context("attaching USDT probes")?;
        self.metrics
            .set_probes(report.attached_count(), report.total());

        for (probe, reason) in &report.skipped {
            warn!(probe = %probe, reason = %reason, "probe not attached");
        }
        if report.attached_count() == 0 {
            bail!(
                "no USDT probes could be attached to pid {} ({}); is bitcoind built with USDT support?",
                self.pid,
                self.cfg.bitcoind_path.display()
            );
        }
        info!(
            attached = report.attached_count(),
            total = report.total(),
            pid = self.pid,
            "USDT probes attached"
        );

        // 3. Start streaming into the pipeline.
        let (sink, rx) = EventSink::channel(self.cfg.channel_capacity);
        self.spawn_pipeline(sink.clone(), rx);

        self.source
            .start(self.cancel.child_token(), sink)
            .await
            .context("starting probe source")?;

        // 4. Background monitors.
        self.spawn_liveness_monitor();
        self.spawn_event_stats_reporter();

        self.metrics.set_up(true);
        info!(pid = self.pid, node = %self.cfg.node_name, "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "background task failed");
            }
        }

        // Detach probes and release semaphores.
        if let Err(e) = self.source.stop().await {
            error!(error = %e, "error stopping probe source");
        }

        self.metrics.set_up(false);

        // Let in-flight scrapes finish.
        self.server.stop().await?;

        info!("agent stopped");
        Ok(())
    }

    /// Spawn the single-writer task that owns the correlator.
    fn spawn_pipeline(&mut self, sink: EventSink, mut rx: mpsc::Receiver<RawEvent>) {
        let cancel = self.cancel.clone();
        let sweep_interval = self.cfg.race.sweep_interval;
        let mut pipeline = Pipeline::new(
            self.cfg.race.correlator_config(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.stats),
            self.cfg.verbose,
        );

        self.tasks.push(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = rx.recv() => {
                        let Some(raw) = maybe else {
                            debug!("event channel closed");
                            break;
                        };
                        // Rejections are counted inside the pipeline.
                        let _ = pipeline.process(&raw, Instant::now());
                        pipeline.record_source_losses(sink.take_dropped(), sink.take_truncated());
                    }
                    _ = sweep.tick() => {
                        pipeline.sweep(Instant::now());
                        pipeline.record_source_losses(sink.take_dropped(), sink.take_truncated());
                    }
                }
            }

            // Records already queued are still worth counting.
            while let Ok(raw) = rx.try_recv() {
                let _ = pipeline.process(&raw, Instant::now());
            }
            pipeline.record_source_losses(sink.take_dropped(), sink.take_truncated());

            debug!(
                inflight = pipeline.correlator().len(),
                "event pipeline stopped"
            );
        }));
    }

    /// Spawn the target-process liveness check.
    fn spawn_liveness_monitor(&mut self) {
        let cancel = self.cancel.clone();
        let fatal = self.fatal.clone();
        let procfs = self.procfs.clone();
        let pid = self.pid;
        let poll_interval = self.cfg.process_check_interval;

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if !procfs.is_alive(pid) {
                            error!(pid, "bitcoind process exited");
                            fatal.cancel();
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();
                        let total = snapshot.total();

                        if total == 0 && snapshot.rejected == 0 {
                            continue;
                        }

                        info!(
                            processed = total,
                            rejected = snapshot.rejected,
                            "event stats (60s)",
                        );

                        for (kind, count) in &snapshot.per_kind {
                            debug!(
                                event_type = %kind,
                                count,
                                "  by type (60s)",
                            );
                        }
                    }
                }
            }
        }));
    }
}
