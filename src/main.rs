use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use fibre_exporter::config::{Config, Overrides};
use fibre_exporter::version;

/// USDT-based FIBRE vs compact block race exporter for bitcoind.
#[derive(Parser)]
#[command(name = "fibre-exporter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "FIBRE_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Why the exporter is shutting down.
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
enum Shutdown {
    Signal,
    TargetExited,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("fibre-exporter {}", version::full());
        return Ok(());
    }

    let cfg = Config::resolve(cli.config.as_deref(), &cli.overrides)
        .context("loading configuration")?;

    init_tracing(&cfg)?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        bitcoind_path = %cfg.bitcoind_path.display(),
        node = %cfg.node_name,
        "starting fibre-exporter",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

/// Stdout logging plus an optional plain-text copy in `log_file`.
fn init_tracing(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    let file_layer = match &cfg.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Arc::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .context("initializing logging")?;

    Ok(())
}

#[cfg(feature = "bpf")]
async fn run(cfg: Config) -> Result<()> {
    use fibre_exporter::agent::{self, Agent};
    use fibre_exporter::pid::ProcFs;
    use fibre_exporter::probe::bpf::BpfProbeSource;

    let pid = agent::resolve_pid(&cfg, &ProcFs::default())?;
    tracing::info!(pid, "target process resolved");

    let source = BpfProbeSource::new(&cfg.bitcoind_path, pid, cfg.ring_buffer_size);
    let mut agent = Agent::new(cfg, pid, source)?;

    if let Err(e) = agent.start().await {
        if let Err(stop_err) = agent.stop().await {
            tracing::error!(error = %stop_err, "error during shutdown after failed start");
        }
        return Err(e);
    }

    let reason = wait_for_shutdown(agent.fatal_token()).await;

    // Graceful shutdown.
    agent.stop().await?;

    match reason {
        Shutdown::Signal => {
            tracing::info!("fibre-exporter stopped");
            Ok(())
        }
        Shutdown::TargetExited => anyhow::bail!("bitcoind process {pid} exited"),
    }
}

#[cfg(not(feature = "bpf"))]
async fn run(cfg: Config) -> Result<()> {
    anyhow::bail!(
        "fibre-exporter was built without BPF support; rebuild with `--features bpf` to trace {}",
        cfg.bitcoind_path.display()
    )
}

/// Wait for SIGINT, SIGTERM, or the agent's fatal signal.
#[cfg_attr(not(feature = "bpf"), allow(dead_code))]
async fn wait_for_shutdown(fatal: CancellationToken) -> Shutdown {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
            Shutdown::Signal
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
            Shutdown::Signal
        }
        _ = fatal.cancelled() => {
            tracing::error!("target process gone, shutting down");
            Shutdown::TargetExited
        }
    }
}
