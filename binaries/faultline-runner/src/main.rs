//! Faultline Runner - runs workloads against a cluster while injecting faults.
//!
//! A run prepares the cluster, drives concurrent client processes through a
//! workload, lets one nemesis break the cluster on a schedule, and saves the
//! resulting history for an external checker. The matrix mode repeats runs
//! over every nemesis and workload pair until a time budget is spent.
//!
//! # Usage
//!
//! ```bash
//! # One bank run against the in-process cluster
//! faultline-runner run --workload bank --nemesis kill-tserver
//!
//! # Every pair for an hour, with the clock nemeses
//! faultline-runner matrix --max-time 3600 --enable-clock-skew
//!
//! # Render the shell commands instead of executing them
//! faultline-runner --mode dry-run --nodes n1,n2,n3 run --nemesis partition-ring
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     faultline-runner                     │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌────────────────┐                 │
//! │  │ client workers │   │ nemesis runner │                 │
//! │  └───────┬────────┘   └───────┬────────┘                 │
//! │          │ operations         │ fault events             │
//! │  ┌───────▼────────────────────▼───────┐   ┌───────────┐  │
//! │  │          history recorder          ├──►│ jsonl dir │  │
//! │  └────────────────────────────────────┘   └───────────┘  │
//! │          │                    │                          │
//! │  ┌───────▼────────┐   ┌───────▼────────────────────┐     │
//! │  │   connector    │   │ cluster controller / net   │     │
//! │  └────────────────┘   └────────────────────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod config;
mod matrix;
mod run;
mod sim;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{ClusterMode, RunnerConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments for the runner.
#[derive(Parser, Debug)]
#[command(
    name = "faultline-runner",
    about = "Runs database workloads under injected faults and records the history",
    version
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Directory that receives run histories.
    #[arg(long, value_name = "DIR", global = true)]
    store: Option<PathBuf>,

    /// Cluster mode (simulated, dry-run, ssh).
    #[arg(long, value_name = "MODE", global = true)]
    mode: Option<ClusterMode>,

    /// Comma-separated database hosts.
    #[arg(long, value_name = "HOSTS", value_delimiter = ',', global = true)]
    nodes: Option<Vec<String>>,

    /// Client processes: a number, or `<k>n` for k per node.
    #[arg(long, value_name = "N", global = true)]
    concurrency: Option<String>,

    /// Seed for operation sources and faults.
    #[arg(long, value_name = "SEED", global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

/// What to do. Defaults to a single run.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one workload under one nemesis.
    Run(RunArgs),
    /// Run every nemesis and workload pair until the time budget is spent.
    Matrix(MatrixArgs),
}

/// Arguments of `run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Workload name.
    #[arg(short, long)]
    workload: Option<String>,

    /// Nemesis name or alias.
    #[arg(short, long)]
    nemesis: Option<String>,

    /// Workload duration in seconds.
    #[arg(long, value_name = "SECS")]
    time_limit: Option<u64>,
}

/// Arguments of `matrix`.
#[derive(Args, Debug)]
pub struct MatrixArgs {
    /// Stop starting new runs after this many seconds.
    #[arg(long, value_name = "SECS")]
    max_time: Option<u64>,

    /// Upper bound for one run in seconds.
    #[arg(long, value_name = "SECS")]
    run_timeout: Option<u64>,

    /// Workload duration of each run in seconds.
    #[arg(long, value_name = "SECS")]
    time_limit: Option<u64>,

    /// Include the clock nemeses.
    #[arg(long)]
    enable_clock_skew: bool,

    /// Comma-separated workloads to cycle through.
    #[arg(long, value_delimiter = ',')]
    workloads: Option<Vec<String>>,

    /// Comma-separated nemeses to cycle through.
    #[arg(long, value_delimiter = ',')]
    nemeses: Option<Vec<String>>,
}

/// Initialize tracing with the given configuration.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs || config.format == "json" {
        "json"
    } else {
        &config.format
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))?;
        }
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn controller_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    if args.print_config {
        let config = RunnerConfig::default();
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut config = if let Some(ref config_path) = args.config {
        RunnerConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        RunnerConfig::default()
    };
    config.merge_cli_args(&args);
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging, args.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %controller_host(),
        started_at = %chrono::Utc::now().to_rfc3339(),
        mode = ?config.cluster.mode,
        "Faultline runner starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    match args.command {
        Some(Command::Matrix(_)) => {
            let totals = matrix::run_matrix(&config, shutdown_rx).await?;
            info!(
                tests_run = totals.tests_run,
                looks_good = totals.looks_good,
                timed_out = totals.timed_out,
                errored = totals.errored,
                "Matrix finished"
            );
        }
        Some(Command::Run(_)) | None => {
            let workload = config.test.workload.clone();
            let nemesis = config.test.nemesis.clone();
            let report = run::run_test(&config, &workload, &nemesis, shutdown_rx).await?;
            let (ok, fail, info) = report.outcomes;
            info!(
                workload = %report.workload,
                nemesis = %report.nemesis,
                dir = %report.dir.display(),
                entries = report.entries,
                ok,
                fail,
                info,
                faults_applied = report.nemesis_summary.applied,
                "Run finished"
            );
            if !report.looks_good() {
                warn!(
                    violations = report.invariant.violations.len(),
                    "History failed the sanity check"
                );
                anyhow::bail!("Anomalies found, see {}", report.dir.display());
            }
        }
    }

    info!("Faultline runner stopped");
    Ok(())
}
