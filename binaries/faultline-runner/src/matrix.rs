//! Repeated runs over every nemesis and workload pair.
//!
//! The matrix loops over nemeses (outer) and workloads (inner) until the
//! maximum time is spent or a shutdown is requested, keeping running totals
//! of how many runs completed, passed their sanity check or timed out. A run
//! that exceeds its timeout is asked to wind down, so its nemesis still heals
//! the cluster and its history is still saved.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::RunnerConfig;
use crate::run::{RunReport, run_test};

/// Running totals of a matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixTotals {
    /// Runs started.
    pub tests_run: u64,
    /// Runs whose history passed the sanity check.
    pub looks_good: u64,
    /// Runs stopped by the per-run timeout.
    pub timed_out: u64,
    /// Runs that failed before producing a history.
    pub errored: u64,
    /// Time spent inside runs.
    pub test_time: Duration,
}

impl MatrixTotals {
    /// Average time per run.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.tests_run) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.test_time / n,
        }
    }
}

enum Finish {
    Completed,
    TimedOut,
    Interrupted,
}

/// Runs one pair, enforcing the run timeout and forwarding shutdown.
async fn run_bounded(
    config: &RunnerConfig,
    workload: &str,
    nemesis: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> (Result<RunReport>, Finish) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let run = run_test(config, workload, nemesis, stop_rx);
    tokio::pin!(run);

    let finish = tokio::select! {
        result = &mut run => return (result, Finish::Completed),
        () = tokio::time::sleep(config.matrix.run_timeout()) => Finish::TimedOut,
        _ = shutdown.changed() => Finish::Interrupted,
    };
    let _ = stop_tx.send(true);
    (run.await, finish)
}

/// Runs the matrix until the maximum time or a shutdown.
pub async fn run_matrix(
    config: &RunnerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<MatrixTotals> {
    let nemeses = config.matrix.active_nemeses();
    let workloads = config.matrix.workloads.clone();
    let max_time = config.matrix.max_time();
    let started = Instant::now();
    let mut totals = MatrixTotals::default();

    info!(
        nemeses = nemeses.len(),
        workloads = workloads.len(),
        max_time_secs = max_time.map(|d| d.as_secs()),
        "Starting test matrix"
    );

    'outer: loop {
        for nemesis in &nemeses {
            for workload in &workloads {
                if *shutdown.borrow() {
                    break 'outer;
                }
                if let Some(limit) = max_time {
                    if started.elapsed() > limit {
                        info!(
                            elapsed_secs = started.elapsed().as_secs(),
                            "Time limit exceeded, not running any more tests"
                        );
                        break 'outer;
                    }
                }

                info!(workload = %workload, nemesis = %nemesis, "Running test");
                let run_started = Instant::now();
                let (result, finish) = run_bounded(config, workload, nemesis, &mut shutdown).await;
                totals.tests_run += 1;
                totals.test_time += run_started.elapsed();

                if matches!(finish, Finish::TimedOut) {
                    totals.timed_out += 1;
                    warn!(workload = %workload, nemesis = %nemesis, "Test timed out");
                }
                match result {
                    Ok(report) if report.looks_good() => {
                        if matches!(finish, Finish::Completed) {
                            totals.looks_good += 1;
                        }
                        info!(dir = %report.dir.display(), "Everything looks good");
                    }
                    Ok(report) => {
                        error!(
                            dir = %report.dir.display(),
                            violations = report.invariant.violations.len(),
                            "Anomalies found"
                        );
                    }
                    Err(e) => {
                        totals.errored += 1;
                        error!(workload = %workload, nemesis = %nemesis, error = %e, "Test failed");
                    }
                }

                info!(
                    tests_run = totals.tests_run,
                    looks_good = totals.looks_good,
                    timed_out = totals.timed_out,
                    errored = totals.errored,
                    elapsed_secs = started.elapsed().as_secs(),
                    test_time_secs = totals.test_time.as_secs(),
                    avg_test_secs = totals.average().as_secs(),
                    "Matrix progress"
                );

                if matches!(finish, Finish::Interrupted) {
                    break 'outer;
                }
            }
        }
        if nemeses.is_empty() || workloads.is_empty() {
            warn!("Nothing to run");
            break;
        }
    }

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_config(store: &std::path::Path) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.test.nodes = ["n1", "n2", "n3"].map(String::from).to_vec();
        config.test.concurrency = "1n".to_string();
        config.test.time_limit_secs = 3;
        config.test.seed = Some(5);
        config.nemesis.schedule.interval_secs = 1;
        config.nemesis.schedule.duration_secs = 1;
        config.nemesis.recovery.delay_ms = 10;
        config.client.op_timeout_ms = 200;
        config.matrix.workloads = vec!["bank".to_string(), "single-key-acid".to_string()];
        config.matrix.nemeses = vec!["none".to_string(), "kill-tserver".to_string()];
        config.store.root = store.to_path_buf();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_matrix_stops_at_max_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = matrix_config(dir.path());
        // Four runs of at least three seconds each fit before the check trips.
        config.matrix.max_time_secs = Some(10);
        let (_tx, rx) = watch::channel(false);

        let totals = run_matrix(&config, rx).await.unwrap();
        assert!(totals.tests_run >= 4, "{totals:?}");
        assert_eq!(totals.timed_out, 0);
        assert_eq!(totals.errored, 0);
        assert_eq!(totals.looks_good, totals.tests_run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matrix_counts_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = matrix_config(dir.path());
        config.test.time_limit_secs = 600;
        config.matrix.run_timeout_secs = 2;
        config.matrix.max_time_secs = Some(1);
        config.matrix.nemeses = vec!["none".to_string()];
        config.matrix.workloads = vec!["bank".to_string()];
        let (_tx, rx) = watch::channel(false);

        let totals = run_matrix(&config, rx).await.unwrap();
        assert_eq!(totals.tests_run, 1);
        assert_eq!(totals.timed_out, 1);
        assert_eq!(totals.looks_good, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_matrix_honors_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = matrix_config(dir.path());
        let (tx, rx) = watch::channel(false);

        let matrix = tokio::spawn(async move { run_matrix(&config, rx).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();

        let totals = matrix.await.unwrap().unwrap();
        assert_eq!(totals.tests_run, 1);
        assert_eq!(totals.timed_out, 0);
    }

    #[test]
    fn test_average() {
        let totals = MatrixTotals {
            tests_run: 4,
            test_time: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(totals.average(), Duration::from_millis(2500));
        assert_eq!(MatrixTotals::default().average(), Duration::ZERO);
    }
}
