use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::export::auth::Credentials;
use crate::export::{ServerSettings, TlsFiles};
use crate::race::{CorrelatorConfig, TiePolicy};

/// Top-level configuration for the FIBRE exporter.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the bitcoind binary carrying the USDT probes. Required.
    #[serde(default)]
    pub bitcoind_path: PathBuf,

    /// Target process. Discovered from `bitcoind_path` when unset.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Value of the `node` label on block metrics. Default: "localhost".
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Metrics listener port. Default: 9435.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Health listener port. Default: 9436.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Address both listeners bind to. Default: 0.0.0.0.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,

    /// Namespace for every exported metric. Default: "fibre".
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,

    /// Log every decoded event at info level.
    #[serde(default)]
    pub verbose: bool,

    /// Logging filter (trace, debug, info, warn, error, or an EnvFilter
    /// directive). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional file that receives a copy of the log output.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub metrics_auth_username: Option<String>,

    #[serde(default)]
    pub metrics_auth_password: Option<String>,

    /// PEM certificate for the metrics listener.
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,

    /// PEM private key for the metrics listener.
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,

    /// Race correlation limits.
    #[serde(default)]
    pub race: RaceConfig,

    /// Capacity of the channel between the probe source and the pipeline.
    /// Default: 8192.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// BPF ring buffer size in bytes. Must be a power of two. Default: 4MB.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: u32,

    /// How long HTTP requests may drain on shutdown. Default: 5s.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// How often the target process is checked for liveness. Default: 5s.
    #[serde(default = "default_process_check_interval", with = "humantime_serde")]
    pub process_check_interval: Duration,
}

/// Race correlation limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RaceConfig {
    /// Records older than this are evicted. Default: 30m.
    #[serde(default = "default_max_age", with = "humantime_serde")]
    pub max_age: Duration,

    /// Maximum in-flight records. Default: 1024.
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// How often aged records are swept. Default: 30s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// How exact latency ties are reported. Default: record.
    #[serde(default)]
    pub tie_policy: TiePolicy,

    /// How long retired heights are remembered. Default: twice `max_age`.
    #[serde(default, with = "humantime_serde")]
    pub retired_retention: Option<Duration>,
}

/// Command-line and environment overrides, applied on top of the file.
#[derive(Debug, Default, Clone, clap::Args)]
pub struct Overrides {
    /// Path to the bitcoind binary.
    #[arg(long, env = "FIBRE_BITCOIND_PATH")]
    pub bitcoind_path: Option<PathBuf>,

    /// bitcoind process id (discovered when omitted).
    #[arg(long, env = "FIBRE_PID")]
    pub pid: Option<u32>,

    /// Node label for block metrics.
    #[arg(long, env = "FIBRE_NODE_NAME")]
    pub node_name: Option<String>,

    /// Metrics listener port.
    #[arg(long, env = "FIBRE_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Health listener port.
    #[arg(long, env = "FIBRE_HEALTH_PORT")]
    pub health_port: Option<u16>,

    /// Listen address for both listeners.
    #[arg(long, env = "FIBRE_LISTEN_ADDR")]
    pub listen_addr: Option<IpAddr>,

    /// Metric name prefix.
    #[arg(long, env = "FIBRE_METRICS_PREFIX")]
    pub metrics_prefix: Option<String>,

    /// Log every event at info level. `--verbose=false` turns it off.
    #[arg(
        short,
        long,
        env = "FIBRE_VERBOSE",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub verbose: Option<bool>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, env = "FIBRE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Also write logs to this file.
    #[arg(long, env = "FIBRE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Basic auth username for /metrics.
    #[arg(long, env = "FIBRE_METRICS_AUTH_USERNAME")]
    pub metrics_auth_username: Option<String>,

    /// Basic auth password for /metrics.
    #[arg(long, env = "FIBRE_METRICS_AUTH_PASSWORD", hide_env_values = true)]
    pub metrics_auth_password: Option<String>,

    /// TLS certificate (PEM) for the metrics listener.
    #[arg(long, env = "FIBRE_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key (PEM) for the metrics listener.
    #[arg(long, env = "FIBRE_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,
}

// --- Default value functions ---

fn default_node_name() -> String {
    "localhost".to_string()
}

fn default_metrics_port() -> u16 {
    9435
}

fn default_health_port() -> u16 {
    9436
}

fn default_listen_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_metrics_prefix() -> String {
    "fibre".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    8192
}

fn default_ring_buffer_size() -> u32 {
    4 * 1024 * 1024 // 4MB
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_process_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_age() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_records() -> usize {
    1024
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            bitcoind_path: PathBuf::new(),
            pid: None,
            node_name: default_node_name(),
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            listen_addr: default_listen_addr(),
            metrics_prefix: default_metrics_prefix(),
            verbose: false,
            log_level: default_log_level(),
            log_file: None,
            metrics_auth_username: None,
            metrics_auth_password: None,
            tls_cert_path: None,
            tls_key_path: None,
            race: RaceConfig::default(),
            channel_capacity: default_channel_capacity(),
            ring_buffer_size: default_ring_buffer_size(),
            shutdown_grace: default_shutdown_grace(),
            process_check_interval: default_process_check_interval(),
        }
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
            max_records: default_max_records(),
            sweep_interval: default_sweep_interval(),
            tie_policy: TiePolicy::default(),
            retired_retention: None,
        }
    }
}

impl RaceConfig {
    pub fn correlator_config(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            max_age: self.max_age,
            max_records: self.max_records,
            retired_retention: self.retired_retention.unwrap_or(self.max_age * 2),
            tie_policy: self.tie_policy,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Build the effective configuration: defaults, then the optional file,
    /// then command-line/environment overrides. The result is validated.
    pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply(overrides);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply every override that was supplied.
    pub fn apply(&mut self, o: &Overrides) {
        if let Some(v) = &o.bitcoind_path {
            self.bitcoind_path = v.clone();
        }
        if let Some(v) = o.pid {
            self.pid = Some(v);
        }
        if let Some(v) = &o.node_name {
            self.node_name = v.clone();
        }
        if let Some(v) = o.metrics_port {
            self.metrics_port = v;
        }
        if let Some(v) = o.health_port {
            self.health_port = v;
        }
        if let Some(v) = o.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = &o.metrics_prefix {
            self.metrics_prefix = v.clone();
        }
        if let Some(v) = o.verbose {
            self.verbose = v;
        }
        if let Some(v) = &o.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &o.log_file {
            self.log_file = Some(v.clone());
        }
        if let Some(v) = &o.metrics_auth_username {
            self.metrics_auth_username = Some(v.clone());
        }
        if let Some(v) = &o.metrics_auth_password {
            self.metrics_auth_password = Some(v.clone());
        }
        if let Some(v) = &o.tls_cert_path {
            self.tls_cert_path = Some(v.clone());
        }
        if let Some(v) = &o.tls_key_path {
            self.tls_key_path = Some(v.clone());
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.bitcoind_path.as_os_str().is_empty() {
            bail!("bitcoind_path is required");
        }

        match (&self.metrics_auth_username, &self.metrics_auth_password) {
            (Some(_), None) | (None, Some(_)) => bail!(
                "metrics_auth_username and metrics_auth_password must both be set to enable authentication"
            ),
            (Some(user), Some(pass)) => {
                if user.is_empty() {
                    bail!("metrics_auth_username must not be empty");
                }
                if pass.is_empty() {
                    bail!("metrics_auth_password must not be empty");
                }
            }
            (None, None) => {}
        }

        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                bail!("tls_cert_path and tls_key_path must both be set to enable TLS")
            }
            _ => {}
        }

        if self.metrics_port == 0 {
            bail!("metrics_port must be non-zero");
        }
        if self.health_port == 0 {
            bail!("health_port must be non-zero");
        }
        if self.metrics_port == self.health_port {
            bail!(
                "metrics_port and health_port must differ (both are {})",
                self.metrics_port
            );
        }

        if !is_valid_prefix(&self.metrics_prefix) {
            bail!(
                "metrics_prefix {:?} is not a valid Prometheus metric name prefix",
                self.metrics_prefix
            );
        }

        if self.node_name.is_empty() {
            bail!("node_name must not be empty");
        }

        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        if !self.ring_buffer_size.is_power_of_two() {
            bail!(
                "ring_buffer_size must be a power of two, got {}",
                self.ring_buffer_size
            );
        }

        if self.process_check_interval.is_zero() {
            bail!("process_check_interval must be positive");
        }

        if self.race.max_age.is_zero() {
            bail!("race.max_age must be positive");
        }
        if self.race.max_records == 0 {
            bail!("race.max_records must be positive");
        }
        if self.race.sweep_interval.is_zero() {
            bail!("race.sweep_interval must be positive");
        }

        Ok(())
    }

    /// Basic auth credentials, when both halves are configured.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.metrics_auth_username, &self.metrics_auth_password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        }
    }

    pub fn tls_files(&self) -> Option<TlsFiles> {
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            listen_addr: self.listen_addr,
            metrics_port: self.metrics_port,
            health_port: self.health_port,
            auth: self.credentials(),
            tls: self.tls_files(),
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// A namespace must itself be a valid metric name: `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            bitcoind_path: PathBuf::from("/usr/local/bin/bitcoind"),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.node_name, "localhost");
        assert_eq!(cfg.metrics_port, 9435);
        assert_eq!(cfg.health_port, 9436);
        assert_eq!(cfg.metrics_prefix, "fibre");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.channel_capacity, 8192);
        assert_eq!(cfg.ring_buffer_size, 4 * 1024 * 1024);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(5));
        assert_eq!(cfg.race.max_age, Duration::from_secs(1800));
        assert_eq!(cfg.race.max_records, 1024);
        assert_eq!(cfg.race.sweep_interval, Duration::from_secs(30));
        assert_eq!(cfg.race.tie_policy, TiePolicy::Record);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
bitcoind_path: /opt/bitcoin/bin/bitcoind
node_name: relay-fra-1
metrics_port: 19435
listen_addr: 127.0.0.1
race:
  max_age: 10m
  max_records: 64
  tie_policy: prefer_fast
shutdown_grace: 2s
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.bitcoind_path, PathBuf::from("/opt/bitcoin/bin/bitcoind"));
        assert_eq!(cfg.node_name, "relay-fra-1");
        assert_eq!(cfg.metrics_port, 19435);
        assert_eq!(cfg.health_port, 9436);
        assert_eq!(cfg.listen_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(cfg.race.max_age, Duration::from_secs(600));
        assert_eq!(cfg.race.max_records, 64);
        assert_eq!(cfg.race.tie_policy, TiePolicy::PreferFast);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(2));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_retired_retention_defaults_to_twice_max_age() {
        let mut race = RaceConfig {
            max_age: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(
            race.correlator_config().retired_retention,
            Duration::from_secs(120)
        );

        race.retired_retention = Some(Duration::from_secs(5));
        assert_eq!(
            race.correlator_config().retired_retention,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut cfg = valid_config();
        cfg.node_name = "from-file".to_string();
        cfg.metrics_port = 1000;

        cfg.apply(&Overrides {
            node_name: Some("from-cli".to_string()),
            verbose: Some(true),
            ..Default::default()
        });

        assert_eq!(cfg.node_name, "from-cli");
        assert_eq!(cfg.metrics_port, 1000);
        assert!(cfg.verbose);
    }

    #[test]
    fn test_verbose_override_can_disable() {
        let mut cfg = valid_config();
        cfg.verbose = true;

        cfg.apply(&Overrides::default());
        assert!(cfg.verbose);

        cfg.apply(&Overrides {
            verbose: Some(false),
            ..Default::default()
        });
        assert!(!cfg.verbose);
    }

    #[test]
    fn test_verbose_flag_forms() {
        use clap::Parser;

        #[derive(Parser)]
        struct Cli {
            #[command(flatten)]
            overrides: Overrides,
        }

        let parse = |args: &[&str]| Cli::try_parse_from(args).unwrap().overrides.verbose;
        assert_eq!(parse(&["fibre-exporter", "--verbose"]), Some(true));
        assert_eq!(parse(&["fibre-exporter", "-v"]), Some(true));
        assert_eq!(parse(&["fibre-exporter", "--verbose=false"]), Some(false));
        assert_eq!(parse(&["fibre-exporter", "--verbose=no"]), Some(false));
    }

    #[test]
    fn test_resolve_from_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fibre.yaml");
        std::fs::write(&path, "bitcoind_path: /usr/bin/bitcoind\nmetrics_port: 9500\n").unwrap();

        let cfg = Config::resolve(
            Some(&path),
            &Overrides {
                metrics_port: Some(9600),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.metrics_port, 9600);
        assert_eq!(cfg.bitcoind_path, PathBuf::from("/usr/bin/bitcoind"));
    }

    #[test]
    fn test_validation_missing_bitcoind_path() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("bitcoind_path"));
    }

    #[test]
    fn test_validation_half_auth_pair() {
        let cfg = Config {
            metrics_auth_username: Some("prom".to_string()),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("metrics_auth_password"));

        let cfg = Config {
            metrics_auth_password: Some("secret".to_string()),
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_empty_auth_values() {
        let cfg = Config {
            metrics_auth_username: Some(String::new()),
            metrics_auth_password: Some("secret".to_string()),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("metrics_auth_username"));
    }

    #[test]
    fn test_validation_half_tls_pair() {
        let cfg = Config {
            tls_cert_path: Some(PathBuf::from("/etc/fibre/cert.pem")),
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tls_key_path"));
    }

    #[test]
    fn test_validation_ports() {
        let cfg = Config {
            health_port: 9435,
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("must differ"));

        let cfg = Config {
            metrics_port: 0,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_prefix() {
        for bad in ["", "1fibre", "fi-bre", "fibre exporter"] {
            let cfg = Config {
                metrics_prefix: bad.to_string(),
                ..valid_config()
            };
            assert!(cfg.validate().is_err(), "prefix {bad:?} accepted");
        }
        for good in ["fibre", "_fibre", "relay_v2"] {
            let cfg = Config {
                metrics_prefix: good.to_string(),
                ..valid_config()
            };
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn test_validation_race_limits() {
        let mut cfg = valid_config();
        cfg.race.max_records = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("race.max_records"));

        let mut cfg = valid_config();
        cfg.race.sweep_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_ring_buffer_power_of_two() {
        let cfg = Config {
            ring_buffer_size: 3 * 1024 * 1024,
            ..valid_config()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ring_buffer_size"));
    }

    #[test]
    fn test_server_settings() {
        let cfg = Config {
            metrics_auth_username: Some("prom".to_string()),
            metrics_auth_password: Some("secret".to_string()),
            ..valid_config()
        };
        let settings = cfg.server_settings();
        assert_eq!(settings.metrics_port, 9435);
        assert_eq!(settings.auth.unwrap().username(), "prom");
        assert!(settings.tls.is_none());
    }
}
