//! Runner configuration.
//!
//! Loaded from a TOML file, overridden by CLI flags and validated before a
//! run starts. Every section has defaults, so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use faultline_client::ClientConfig;
use faultline_core::NodeId;
use faultline_nemesis::{AwaitPolicy, Edition, NemesisRegistry, Os, ScheduleConfig};
use faultline_workload::{BankConfig, WORKLOAD_NAMES};
use serde::{Deserialize, Serialize};

use crate::{CliArgs, Command};

/// Runner configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// What to run.
    pub test: TestConfig,

    /// Nemesis timing.
    pub nemesis: NemesisConfig,

    /// Client runtime timeouts and retries.
    pub client: ClientConfig,

    /// Bank workload shape.
    pub bank: BankConfig,

    /// Cluster access.
    pub cluster: ClusterConfig,

    /// Test matrix.
    pub matrix: MatrixConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// History storage.
    pub store: StoreConfig,
}

/// A single test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Workload name.
    pub workload: String,

    /// Nemesis name or alias.
    pub nemesis: String,

    /// Database hosts.
    pub nodes: Vec<String>,

    /// Number of client processes: a plain number, or `<k>n` for k per node.
    pub concurrency: String,

    /// How long the workload runs, in seconds.
    pub time_limit_secs: u64,

    /// Seed for operation sources and faults. Random if unset.
    pub seed: Option<u64>,

    /// Whether to drop the workload's schema at the end of the run.
    pub teardown: bool,

    /// Upper bound of the random pause a process takes between operations,
    /// in milliseconds.
    pub stagger_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            workload: "bank".to_string(),
            nemesis: "none".to_string(),
            nodes: ["n1", "n2", "n3", "n4", "n5"].map(String::from).to_vec(),
            concurrency: "4n".to_string(),
            time_limit_secs: 600,
            seed: None,
            teardown: true,
            stagger_ms: 20,
        }
    }
}

/// Nemesis timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NemesisConfig {
    /// Start/stop and clock schedule timing.
    #[serde(flatten)]
    pub schedule: ScheduleConfig,

    /// Upper bound for one start or stop, in seconds.
    pub action_timeout_secs: u64,

    /// Readiness probing after a fault is reverted.
    pub recovery: AwaitPolicy,
}

impl Default for NemesisConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            action_timeout_secs: 120,
            recovery: AwaitPolicy::default(),
        }
    }
}

impl NemesisConfig {
    /// Returns the action timeout as a Duration.
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

/// How the runner reaches the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterMode {
    /// In-process database and controller.
    Simulated,
    /// Shell commands are rendered and logged, never executed; clients use
    /// the in-process database.
    DryRun,
    /// Shell commands run over ssh.
    Ssh,
}

impl std::str::FromStr for ClusterMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "simulated" | "sim" => Ok(ClusterMode::Simulated),
            "dry-run" => Ok(ClusterMode::DryRun),
            "ssh" => Ok(ClusterMode::Ssh),
            other => bail!("Invalid cluster mode: {other}"),
        }
    }
}

/// Cluster access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How the cluster is reached.
    pub mode: ClusterMode,

    /// Host operating system family.
    pub os: String,

    /// Database edition.
    pub edition: String,

    /// Tarball to install from. The edition's default if unset.
    pub tarball_url: Option<String>,

    /// Whether to install the database before the run.
    pub install: bool,

    /// Remote user for ssh.
    pub ssh_user: String,

    /// Remote port for ssh.
    pub ssh_port: u16,

    /// Per-command timeout for ssh, in seconds.
    pub ssh_timeout_secs: u64,

    /// Whether remote commands run under sudo.
    pub sudo: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Simulated,
            os: "debian".to_string(),
            edition: "community".to_string(),
            tarball_url: None,
            install: false,
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ssh_timeout_secs: 60,
            sudo: false,
        }
    }
}

impl ClusterConfig {
    /// Parses the operating system family.
    pub fn os(&self) -> anyhow::Result<Os> {
        self.os.parse().context("Invalid cluster.os")
    }

    /// Parses the edition.
    pub fn edition(&self) -> anyhow::Result<Edition> {
        self.edition.parse().context("Invalid cluster.edition")
    }

    /// Returns the ssh timeout as a Duration.
    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

/// Test matrix settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Workloads to cycle through.
    pub workloads: Vec<String>,

    /// Nemeses to cycle through. Clock nemeses are skipped unless
    /// `enable_clock_skew` is set.
    pub nemeses: Vec<String>,

    /// Stop starting new runs after this many seconds. Unbounded if unset.
    pub max_time_secs: Option<u64>,

    /// Upper bound for one run including saving, in seconds.
    pub run_timeout_secs: u64,

    /// Whether the clock nemeses take part.
    pub enable_clock_skew: bool,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            workloads: WORKLOAD_NAMES.iter().map(|w| (*w).to_string()).collect(),
            nemeses: [
                "none",
                "stop-tserver",
                "kill-tserver",
                "pause-tserver",
                "stop-master",
                "kill-master",
                "pause-master",
                "stop",
                "kill",
                "pause",
                "partition-half",
                "partition-one",
                "partition-ring",
                "small-skew",
                "medium-skew",
                "large-skew",
                "xlarge-skew",
            ]
            .map(String::from)
            .to_vec(),
            max_time_secs: None,
            run_timeout_secs: 1200,
            enable_clock_skew: false,
        }
    }
}

impl MatrixConfig {
    /// Returns the run timeout as a Duration.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Returns the matrix time budget.
    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_secs.map(Duration::from_secs)
    }

    /// Nemeses taking part, clock nemeses filtered by the flag.
    pub fn active_nemeses(&self) -> Vec<String> {
        self.nemeses
            .iter()
            .filter(|n| self.enable_clock_skew || !NemesisRegistry::is_clock(n))
            .cloned()
            .collect()
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// History storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory receiving one subdirectory per run.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("store"),
        }
    }
}

impl RunnerConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &CliArgs) {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(ref root) = args.store {
            self.store.root = root.clone();
        }
        if let Some(mode) = args.mode {
            self.cluster.mode = mode;
        }
        if let Some(ref nodes) = args.nodes {
            self.test.nodes = nodes.clone();
        }
        if let Some(ref concurrency) = args.concurrency {
            self.test.concurrency = concurrency.clone();
        }
        if let Some(seed) = args.seed {
            self.test.seed = Some(seed);
        }

        match &args.command {
            Some(Command::Run(run)) => {
                if let Some(ref workload) = run.workload {
                    self.test.workload = workload.clone();
                }
                if let Some(ref nemesis) = run.nemesis {
                    self.test.nemesis = nemesis.clone();
                }
                if let Some(secs) = run.time_limit {
                    self.test.time_limit_secs = secs;
                }
            }
            Some(Command::Matrix(matrix)) => {
                if let Some(secs) = matrix.max_time {
                    self.matrix.max_time_secs = Some(secs);
                }
                if let Some(secs) = matrix.run_timeout {
                    self.matrix.run_timeout_secs = secs;
                }
                if let Some(secs) = matrix.time_limit {
                    self.test.time_limit_secs = secs;
                }
                if matrix.enable_clock_skew {
                    self.matrix.enable_clock_skew = true;
                }
                if let Some(ref workloads) = matrix.workloads {
                    self.matrix.workloads = workloads.clone();
                }
                if let Some(ref nemeses) = matrix.nemeses {
                    self.matrix.nemeses = nemeses.clone();
                }
            }
            None => {}
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            bail!("Invalid log format: {}", self.logging.format);
        }

        if self.test.nodes.is_empty() {
            bail!("At least one node is required");
        }
        self.concurrency()?;
        if self.test.time_limit_secs == 0 {
            bail!("test.time_limit_secs must be positive");
        }

        check_workload(&self.test.workload)?;
        check_nemesis(&self.test.nemesis)?;
        for workload in &self.matrix.workloads {
            check_workload(workload)?;
        }
        for nemesis in &self.matrix.nemeses {
            check_nemesis(nemesis)?;
        }
        if self.matrix.run_timeout_secs == 0 {
            bail!("matrix.run_timeout_secs must be positive");
        }

        self.bank.validate()?;
        self.cluster.os()?;
        self.cluster.edition()?;
        Ok(())
    }

    /// Returns the configured nodes.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.test.nodes.iter().map(|n| NodeId::new(n.as_str())).collect()
    }

    /// Resolves the concurrency setting against the node count.
    pub fn concurrency(&self) -> anyhow::Result<u32> {
        parse_concurrency(&self.test.concurrency, self.test.nodes.len())
    }

    /// Returns the time limit as a Duration.
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.test.time_limit_secs)
    }

    /// Returns the stagger bound as a Duration.
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.test.stagger_ms)
    }
}

fn check_workload(name: &str) -> anyhow::Result<()> {
    if WORKLOAD_NAMES.contains(&name) || name == "multi-bank" {
        Ok(())
    } else {
        bail!("Unknown workload: {name} (expected one of {})", WORKLOAD_NAMES.join(", "))
    }
}

fn check_nemesis(name: &str) -> anyhow::Result<()> {
    if NemesisRegistry::canonical(name).is_some() {
        Ok(())
    } else {
        bail!("Unknown nemesis: {name}")
    }
}

/// Parses `"8"` as 8 processes and `"4n"` as four per node.
pub fn parse_concurrency(spec: &str, nodes: usize) -> anyhow::Result<u32> {
    let spec = spec.trim();
    let value = match spec.strip_suffix('n') {
        Some(per_node) => {
            let per_node: u32 = per_node
                .parse()
                .with_context(|| format!("Invalid concurrency: {spec}"))?;
            let nodes = u32::try_from(nodes).context("Too many nodes")?;
            per_node.saturating_mul(nodes)
        }
        None => spec
            .parse()
            .with_context(|| format!("Invalid concurrency: {spec}"))?,
    };
    if value == 0 {
        bail!("Concurrency must be positive, got {spec}");
    }
    Ok(value)
}
