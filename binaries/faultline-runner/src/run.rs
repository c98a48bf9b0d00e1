//! A single test run.
//!
//! Prepares the cluster, creates the schema once, then runs the workload's
//! client processes and the nemesis side by side until the time limit or a
//! shutdown. Each process executes one operation at a time; a process that
//! sees an indeterminate outcome is retired and replaced by a fresh process
//! id, since it may still have a request in flight. The history is checked
//! against the workload's invariant and saved.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use faultline_client::{
    ClientConfig, ClientRuntime, Connector, Guarded, MemoryCluster, SetupGuard, guarded,
};
use faultline_core::{
    HistoryMetadata, HistoryRecorder, JsonLinesStore, NodeId, OpType, Outcome, ProcessId,
};
use faultline_nemesis::{
    ClusterController, Distribution, DryRunRunner, FaultContext, NemesisRegistry, NemesisRunner,
    NemesisSummary, PartitionProvider, Role, ShellController, SshRunner,
};
use faultline_workload::{InvariantReport, OpSource, SharedWorkload};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ClusterMode, RunnerConfig};
use crate::sim::SimulatedCluster;

type Handler = Guarded<SharedWorkload>;

/// Pause before a process retries opening its connection.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Workload name.
    pub workload: String,
    /// Canonical nemesis name.
    pub nemesis: String,
    /// Where the history was saved.
    pub dir: PathBuf,
    /// Number of history entries.
    pub entries: usize,
    /// Client completions: `ok`, `fail`, `info`.
    pub outcomes: (usize, usize, usize),
    /// Nemesis counters.
    pub nemesis_summary: NemesisSummary,
    /// Sanity check of the history.
    pub invariant: InvariantReport,
}

impl RunReport {
    /// Whether the history passed the sanity check.
    pub fn looks_good(&self) -> bool {
        self.invariant.is_valid()
    }
}

/// How the run reaches the cluster and the database.
struct Backend {
    controller: Arc<dyn ClusterController>,
    net: Arc<dyn PartitionProvider>,
    connector: Option<Arc<dyn Connector>>,
}

impl Backend {
    fn new(config: &RunnerConfig, nodes: &[NodeId]) -> Result<Self> {
        let distribution = Distribution::lookup(config.cluster.os()?, config.cluster.edition()?);
        Ok(match config.cluster.mode {
            ClusterMode::Simulated => {
                let sim = SimulatedCluster::new(nodes.to_vec());
                let db: Arc<dyn Connector> = Arc::new(sim.database().clone());
                Self {
                    controller: sim.clone(),
                    net: sim,
                    connector: Some(db),
                }
            }
            ClusterMode::DryRun => {
                let shell = Arc::new(shell_controller(config, distribution, nodes, DryRunRunner::new()));
                Self {
                    controller: shell.clone(),
                    net: shell,
                    connector: Some(Arc::new(MemoryCluster::new(nodes))),
                }
            }
            ClusterMode::Ssh => {
                let runner = SshRunner::new(config.cluster.ssh_user.clone())
                    .port(config.cluster.ssh_port)
                    .timeout(config.cluster.ssh_timeout())
                    .sudo(config.cluster.sudo);
                let shell = Arc::new(shell_controller(config, distribution, nodes, runner));
                Self {
                    controller: shell.clone(),
                    net: shell,
                    connector: None,
                }
            }
        })
    }
}

fn shell_controller<R: faultline_nemesis::CommandRunner>(
    config: &RunnerConfig,
    distribution: Distribution,
    nodes: &[NodeId],
    runner: R,
) -> ShellController<R> {
    let controller = ShellController::new(distribution, nodes.to_vec(), runner);
    match &config.cluster.tarball_url {
        Some(url) => controller.tarball_url(url.clone()),
        None => controller,
    }
}

/// Installs if asked, starts both roles everywhere and waits until they
/// serve.
async fn prepare_cluster(ctx: &FaultContext, install: bool) -> Result<()> {
    let controller = ctx.controller();
    for node in ctx.nodes() {
        if install {
            controller.install(node).await?;
        }
        controller.start_master(node).await?;
    }
    for node in ctx.nodes() {
        controller.start_tserver(node).await?;
    }
    for node in ctx.nodes() {
        ctx.await_role(node, Role::Master).await?;
        ctx.await_role(node, Role::TServer).await?;
    }
    info!(nodes = ctx.nodes().len(), "Cluster ready");
    Ok(())
}

/// Runs one workload under one nemesis.
pub async fn run_test(
    config: &RunnerConfig,
    workload_name: &str,
    nemesis_name: &str,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport> {
    let nodes = config.nodes();
    let concurrency = config.concurrency()?;
    let seed = config.test.seed.unwrap_or_else(rand::random);
    let workload = faultline_workload::lookup(workload_name, &config.bank)?;
    let nemesis_canonical = NemesisRegistry::canonical(nemesis_name)
        .with_context(|| format!("Unknown nemesis: {nemesis_name}"))?;
    let package = NemesisRegistry::new(config.nemesis.schedule.clone())
        .with_seed(seed)
        .build(nemesis_canonical)?;

    info!(
        workload = workload.name(),
        nemesis = nemesis_canonical,
        nodes = nodes.len(),
        concurrency,
        seed,
        mode = ?config.cluster.mode,
        "Starting test run"
    );

    let backend = Backend::new(config, &nodes)?;
    let ctx = Arc::new(
        FaultContext::new(nodes.clone(), backend.controller.clone(), backend.net.clone())
            .with_seed(seed)
            .with_await_policy(config.nemesis.recovery),
    );
    prepare_cluster(&ctx, config.cluster.install)
        .await
        .context("Failed to prepare the cluster")?;

    let recorder = HistoryRecorder::new();
    let handler = guarded(workload.clone(), SetupGuard::new());

    if let Some(connector) = &backend.connector {
        create_schema(connector.clone(), &nodes, handler.clone(), &config.client).await?;
    } else {
        warn!("No database driver for this cluster mode, running the nemesis only");
    }

    let (nemesis_tx, nemesis_rx) = watch::channel(false);
    let nemesis = NemesisRunner::new(package, ctx.clone(), recorder.clone())
        .action_timeout(config.nemesis.action_timeout())
        .spawn(nemesis_rx);

    let deadline = Instant::now() + config.time_limit();
    let mut workers = Vec::new();
    if let Some(connector) = &backend.connector {
        let clients = ClientFactory {
            nodes: nodes.clone(),
            connector: connector.clone(),
            handler: handler.clone(),
            config: config.client.clone(),
            seed,
        };
        for slot in 0..concurrency {
            let worker = Worker {
                slot,
                concurrency,
                clients: clients.clone(),
                recorder: recorder.clone(),
                source: workload.op_source(seed.wrapping_add(u64::from(slot))),
                deadline,
                stagger: config.stagger(),
                shutdown: shutdown.clone(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
    } else {
        let mut shutdown = shutdown.clone();
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {}
            _ = shutdown.changed() => {}
        }
    }

    let mut completed = 0_u64;
    for worker in workers {
        match worker.await {
            Ok(ops) => completed += ops,
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }
    info!(operations = completed, "Workload finished");

    // The nemesis heals the cluster before the history is sealed.
    let _ = nemesis_tx.send(true);
    let nemesis_summary = nemesis.await.context("Nemesis task failed")?;

    if config.test.teardown {
        if let Some(connector) = &backend.connector {
            if let Err(e) = teardown(connector.clone(), &nodes, handler, &config.client).await {
                warn!(error = %e, "Teardown failed");
            }
        }
    }

    let metadata = HistoryMetadata::new(workload.name(), nemesis_canonical)
        .with_nodes(nodes)
        .with_concurrency(concurrency as usize)
        .with_seed(seed);
    let history = recorder.seal(metadata);
    let invariant = workload.invariant();
    let report = invariant.check(&history);
    for violation in &report.violations {
        error!(index = violation.index.0, reason = %violation.reason, "Invariant violated");
    }

    let dir = JsonLinesStore::new(config.store.root.clone())
        .save(&history, &invariant.description())
        .await
        .context("Failed to save history")?;

    Ok(RunReport {
        workload: workload.name().to_string(),
        nemesis: nemesis_canonical.to_string(),
        dir,
        entries: history.len(),
        outcomes: history.outcome_counts(),
        nemesis_summary,
        invariant: report,
    })
}

fn first_node(nodes: &[NodeId]) -> Result<NodeId> {
    nodes.first().cloned().context("At least one node is required")
}

async fn create_schema(
    connector: Arc<dyn Connector>,
    nodes: &[NodeId],
    handler: Handler,
    config: &ClientConfig,
) -> Result<()> {
    let mut client = ClientRuntime::new(
        ProcessId(0),
        first_node(nodes)?,
        connector,
        handler,
        config.clone(),
    );
    client.open().await?;
    let result = client.setup().await;
    client.close().await;
    result.context("Workload setup failed")
}

async fn teardown(
    connector: Arc<dyn Connector>,
    nodes: &[NodeId],
    handler: Handler,
    config: &ClientConfig,
) -> Result<()> {
    let mut client = ClientRuntime::new(
        ProcessId(0),
        first_node(nodes)?,
        connector,
        handler,
        config.clone(),
    );
    client.open().await?;
    let result = client.teardown().await;
    client.close().await;
    Ok(result?)
}

/// Opens clients for worker processes.
#[derive(Clone)]
struct ClientFactory {
    nodes: Vec<NodeId>,
    connector: Arc<dyn Connector>,
    handler: Handler,
    config: ClientConfig,
    seed: u64,
}

impl ClientFactory {
    async fn open(&self, process: ProcessId) -> Result<ClientRuntime<Handler>> {
        let index = process
            .node_index(self.nodes.len())
            .context("At least one node is required")?;
        let mut client = ClientRuntime::new(
            process,
            self.nodes[index].clone(),
            self.connector.clone(),
            self.handler.clone(),
            self.config.clone(),
        )
        .with_seed(self.seed);
        client.open().await?;
        client.setup().await?;
        Ok(client)
    }
}

/// One logical client slot.
struct Worker {
    slot: u32,
    concurrency: u32,
    clients: ClientFactory,
    recorder: HistoryRecorder,
    source: Box<dyn OpSource>,
    deadline: Instant,
    stagger: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    /// Runs operations until the deadline. Returns the number completed.
    async fn run(self) -> u64 {
        let Worker {
            slot,
            concurrency,
            clients,
            recorder,
            mut source,
            deadline,
            stagger,
            mut shutdown,
        } = self;
        let mut rng = ChaCha8Rng::seed_from_u64(clients.seed ^ u64::from(slot));
        let mut process = ProcessId(slot);
        let mut client: Option<ClientRuntime<Handler>> = None;
        let mut completed = 0;

        while !*shutdown.borrow() && Instant::now() < deadline {
            if client.is_none() {
                match clients.open(process).await {
                    Ok(c) => client = Some(c),
                    Err(e) => {
                        debug!(process = %process, error = %e, "Client could not open");
                        tokio::select! {
                            () = tokio::time::sleep(REOPEN_DELAY) => {}
                            _ = shutdown.changed() => {}
                        }
                        continue;
                    }
                }
            }
            let Some(c) = client.as_mut() else {
                continue;
            };

            let op = source.next_op(process);
            if let Err(e) = recorder.record(op.clone()) {
                warn!(error = %e, "History closed, stopping worker");
                break;
            }
            let done = match c.invoke(&op).await {
                Ok(done) => done,
                Err(e) => {
                    error!(process = %process, error = %e, "Client rejected operation");
                    op.complete(Outcome::Info(json!(["client-error", e.to_string()])))
                }
            };
            let indeterminate = done.op_type == OpType::Info;
            if let Err(e) = recorder.record(done) {
                warn!(error = %e, "History closed, stopping worker");
                break;
            }
            completed += 1;

            // Never less than a millisecond between operations.
            let pause = stagger.mul_f64(rng.r#gen::<f64>()).max(Duration::from_millis(1));
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                _ = shutdown.changed() => {}
            }

            if indeterminate {
                c.close().await;
                client = None;
                let next = ProcessId(process.inner() + concurrency);
                debug!(process = %process, next = %next, "Retiring process after indeterminate outcome");
                process = next;
            }
        }

        if let Some(mut c) = client {
            c.close().await;
        }
        completed
    }
}
