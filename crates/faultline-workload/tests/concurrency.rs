//! Workloads driven by concurrent client runtimes against the in-memory
//! cluster while nodes fail and transient errors are injected.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use faultline_client::{
    ClientConfig, ClientRuntime, DriverError, InjectPoint, MemoryCluster, RetryPolicy, SetupGuard,
    guarded,
};
use faultline_core::{History, HistoryMetadata, HistoryRecorder, NodeId, OpType, ProcessId};
use faultline_nemesis::{
    DryRunController, FaultContext, NemesisRegistry, NemesisRunner, ScheduleConfig,
};
use faultline_workload::{BankConfig, SharedWorkload, lookup};
use serde_json::json;
use tokio::sync::watch;

fn nodes() -> Vec<NodeId> {
    ["n1", "n2", "n3"].into_iter().map(NodeId::from).collect()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        op_timeout_ms: 200,
        connect_timeout_ms: 100,
        not_ready_delay_ms: 50,
        retry: RetryPolicy::default().with_max_attempts(4),
    }
}

/// Runs `concurrency` processes for `ops` operations each and returns the
/// sealed history. A process that sees `info` is retired and replaced.
/// `after_setup` runs once the schema exists, before any operation.
async fn run<T>(
    workload: SharedWorkload,
    cluster: &MemoryCluster,
    recorder: &HistoryRecorder,
    concurrency: u32,
    ops: usize,
    after_setup: impl FnOnce() -> T,
) -> (History, T) {
    let nodes = nodes();
    let guard = SetupGuard::new();
    let handler = guarded(workload.clone(), guard);

    // Schema first, through process 0's node.
    let mut first = ClientRuntime::new(
        ProcessId(0),
        nodes[0].clone(),
        Arc::new(cluster.clone()),
        handler.clone(),
        client_config(),
    );
    first.open().await.unwrap();
    first.setup().await.unwrap();
    first.close().await;
    let hooked = after_setup();

    let mut workers = Vec::new();
    for slot in 0..concurrency {
        let handler = handler.clone();
        let cluster = cluster.clone();
        let recorder = recorder.clone();
        let nodes = nodes.clone();
        let mut source = workload.op_source(u64::from(slot));
        workers.push(tokio::spawn(async move {
            let mut process = ProcessId(slot);
            let mut client: Option<ClientRuntime<_>> = None;
            for _ in 0..ops {
                if client.is_none() {
                    let node = nodes[process.node_index(nodes.len()).unwrap()].clone();
                    let mut c = ClientRuntime::new(
                        process,
                        node,
                        Arc::new(cluster.clone()),
                        handler.clone(),
                        client_config(),
                    );
                    if c.open().await.is_err() {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        continue;
                    }
                    c.setup().await.unwrap();
                    client = Some(c);
                }
                let Some(c) = client.as_mut() else {
                    continue;
                };
                let op = source.next_op(process);
                recorder.record(op.clone()).unwrap();
                let done = c.invoke(&op).await.unwrap();
                let indeterminate = done.op_type == OpType::Info;
                recorder.record(done).unwrap();
                if indeterminate {
                    c.close().await;
                    client = None;
                    process = ProcessId(process.inner() + concurrency);
                }
            }
            if let Some(mut c) = client {
                c.close().await;
            }
        }));
    }
    for w in workers {
        w.await.unwrap();
    }
    (recorder.seal(HistoryMetadata::new(workload.name(), "test")), hooked)
}

/// Takes nodes down and up and injects transient and definite errors.
fn chaos(cluster: MemoryCluster, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let nodes = nodes();
        let mut round = 0_usize;
        while !*stop.borrow() {
            let node = &nodes[round % nodes.len()];
            cluster.inject(InjectPoint::Read, DriverError::TryAgain("restart read".into()));
            cluster.inject(InjectPoint::Write, DriverError::Rollback("conflict".into()));
            cluster.inject(
                InjectPoint::AfterCommit,
                DriverError::ConnectionClosed("reset by peer".into()),
            );
            cluster.set_available(node, false);
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(30)) => {}
                _ = stop.changed() => {}
            }
            cluster.set_available(node, true);
            tokio::time::sleep(Duration::from_millis(30)).await;
            round += 1;
        }
        for node in &nodes {
            cluster.set_available(node, true);
        }
    })
}

async fn final_balances(cluster: &MemoryCluster, workload: &str) -> BTreeMap<i64, i64> {
    match workload {
        "bank" => cluster.table("accounts").await.unwrap(),
        _ => {
            let mut out = BTreeMap::new();
            for account in 0..5 {
                let table = cluster.table(&format!("accounts{account}")).await.unwrap();
                out.insert(account, table[&0]);
            }
            out
        }
    }
}

#[tokio::test(start_paused = true)]
async fn bank_total_is_preserved_under_faults() {
    for name in ["bank", "bank-multitable"] {
        let cluster = MemoryCluster::new(&nodes());
        let workload = lookup(name, &BankConfig::default()).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let recorder = HistoryRecorder::new();
        let (history, chaos) = run(workload.clone(), &cluster, &recorder, 6, 60, || {
            chaos(cluster.clone(), stop_rx)
        })
        .await;
        stop_tx.send(true).unwrap();
        chaos.await.unwrap();

        let report = workload.invariant().check(&history);
        assert!(report.is_valid(), "{name}: {:?}", report.violations);
        assert!(report.reads > 0);

        let (ok, fail, info) = history.outcome_counts();
        assert!(ok > 0 && fail > 0 && info > 0, "{name}: {ok}/{fail}/{info}");

        let balances = final_balances(&cluster, name).await;
        assert_eq!(balances.values().sum::<i64>(), 100);
        assert!(balances.values().all(|b| *b >= 0));
    }
}

#[tokio::test(start_paused = true)]
async fn registers_never_report_a_mismatched_cas() {
    let cluster = MemoryCluster::new(&nodes());
    let workload = lookup("single-key-acid", &BankConfig::default()).unwrap();
    let recorder = HistoryRecorder::new();

    // One process and no indeterminate outcomes: a model register tracks
    // every write exactly, so each cas can be judged.
    let (history, ()) = run(workload.clone(), &cluster, &recorder, 1, 300, || {
        for _ in 0..20 {
            cluster.inject(InjectPoint::Write, DriverError::Rollback("conflict".into()));
        }
    })
    .await;

    let mut model: BTreeMap<i64, i64> = (0..5).map(|k| (k, 0)).collect();
    let mut cas_ok = 0;
    for op in history.iter().filter(|op| op.op_type.is_terminal()) {
        let key = op.value[0].as_i64().unwrap();
        match (op.f.as_str(), op.op_type) {
            ("write", OpType::Ok) => {
                model.insert(key, op.value[1].as_i64().unwrap());
            }
            ("cas", OpType::Ok) => {
                cas_ok += 1;
                assert_eq!(model[&key], op.value[1][0].as_i64().unwrap(), "cas at {op}");
                model.insert(key, op.value[1][1].as_i64().unwrap());
            }
            ("cas", OpType::Fail) => {
                if op.error.as_ref().is_some_and(|e| e[0] == "cas-mismatch") {
                    assert_ne!(model[&key], op.value[1][0].as_i64().unwrap(), "cas at {op}");
                }
            }
            ("read", OpType::Ok) => assert_eq!(op.value[1], json!(model[&key]), "read at {op}"),
            (_, OpType::Info) => panic!("unexpected indeterminate outcome {op}"),
            _ => {}
        }
    }
    assert!(cas_ok > 0);
    assert!(workload.invariant().check(&history).is_valid());
}

#[tokio::test(start_paused = true)]
async fn nemesis_events_interleave_with_client_operations() {
    let cluster = MemoryCluster::new(&nodes());
    let workload = lookup("bank", &BankConfig::default()).unwrap();
    let recorder = HistoryRecorder::new();

    let controller = Arc::new(DryRunController::new(&nodes()));
    let ctx = FaultContext::new(nodes(), controller.clone(), controller.clone()).with_seed(3);
    let registry = NemesisRegistry::new(ScheduleConfig {
        interval_secs: 1,
        duration_secs: 1,
        clock_delay_secs: 1,
    })
    .with_seed(3);
    let package = registry.build("kill-tserver").unwrap();
    let (stop_tx, stop_rx) = watch::channel(false);
    let nemesis = NemesisRunner::new(package, Arc::new(ctx), recorder.clone()).spawn(stop_rx);

    // Slow the workload down so it spans several nemesis cycles.
    let pacer = tokio::spawn(async {
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let recorder_for_run = recorder.clone();
    let (history_tx, history_rx) = tokio::sync::oneshot::channel();
    let cluster_for_run = cluster.clone();
    tokio::spawn(async move {
        pacer.await.unwrap();
        let (history, ()) = run(workload, &cluster_for_run, &recorder_for_run, 3, 30, || ()).await;
        let _ = history_tx.send(history);
    });
    let history = history_rx.await.unwrap();
    stop_tx.send(true).unwrap();
    let summary = nemesis.await.unwrap();

    assert!(summary.applied >= 2);
    let starts = history.nemesis_events().filter(|op| op.f == "start").count();
    assert!(starts >= 2);
    assert!(history.iter().any(|op| !op.process.is_nemesis()));
    assert!(
        history
            .nemesis_events()
            .all(|op| op.op_type == OpType::Info)
    );
    // The final stop restarted the killed tserver.
    assert!(!controller.calls_for("start_tserver").is_empty());
}
