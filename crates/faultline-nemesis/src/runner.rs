//! The nemesis task.
//!
//! [`NemesisRunner`] pulls events from a schedule and applies them to its
//! fault, recording each application in the shared history as a pair of
//! `info` entries from the `nemesis` process. It stops pulling as soon as the
//! shutdown signal fires (a pending sleep is interrupted) and then always
//! runs the schedule's terminal events so the cluster is left healed.

use std::sync::Arc;
use std::time::Duration;

use faultline_core::{HistoryRecorder, OpType, Operation};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::context::FaultContext;
use crate::error::NemesisError;
use crate::registry::NemesisPackage;
use crate::schedule::{FaultEvent, Schedule};
use crate::traits::{FaultStatus, SharedFault};

/// Counters of one nemesis run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NemesisSummary {
    /// Successful `start`/`bump` applications that changed something.
    pub applied: u64,
    /// Successful `stop`/`reset` applications that changed something.
    pub reverted: u64,
    /// Applications that returned an error or timed out.
    pub errors: u64,
    /// Whether the schedule was cut short by the shutdown signal.
    pub cancelled: bool,
}

/// Drives one fault through its schedule.
pub struct NemesisRunner {
    fault: SharedFault,
    schedule: Schedule,
    ctx: Arc<FaultContext>,
    recorder: HistoryRecorder,
    action_timeout: Duration,
}

impl NemesisRunner {
    /// Creates a runner for a registry package.
    pub fn new(package: NemesisPackage, ctx: Arc<FaultContext>, recorder: HistoryRecorder) -> Self {
        Self {
            fault: package.fault,
            schedule: package.schedule,
            ctx,
            recorder,
            action_timeout: Duration::from_secs(120),
        }
    }

    /// Bounds every single start/stop call.
    pub fn action_timeout(mut self, action_timeout: Duration) -> Self {
        self.action_timeout = action_timeout;
        self
    }

    /// Runs the nemesis on its own task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<NemesisSummary> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until the schedule ends or `shutdown` becomes `true`. Dropping
    /// the sender counts as shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> NemesisSummary {
        let name = self.fault.name().to_string();
        info!(nemesis = %name, "Nemesis started");

        let mut summary = NemesisSummary::default();
        let final_events = self.schedule.final_events();

        loop {
            if *shutdown.borrow() {
                summary.cancelled = true;
                break;
            }
            let Some(event) = self.schedule.next() else {
                break;
            };
            debug!(nemesis = %name, event = %event, "Next nemesis event");
            match event {
                FaultEvent::Sleep(d) => {
                    tokio::select! {
                        () = tokio::time::sleep(d) => {}
                        _ = shutdown.changed() => {
                            summary.cancelled = true;
                            break;
                        }
                    }
                }
                event => self.apply(event, &mut summary).await,
            }
        }

        if !final_events.is_empty() {
            info!(nemesis = %name, cancelled = summary.cancelled, "Running final nemesis events");
        }
        for event in final_events {
            self.apply(event, &mut summary).await;
        }

        info!(
            nemesis = %name,
            applied = summary.applied,
            reverted = summary.reverted,
            errors = summary.errors,
            "Nemesis finished"
        );
        summary
    }

    async fn apply(&self, event: FaultEvent, summary: &mut NemesisSummary) {
        let Some(f) = event.f() else {
            return;
        };
        self.record(Operation::nemesis(OpType::Info, f, Value::Null));

        let action = async {
            if event.is_apply() {
                self.fault.start(&self.ctx).await
            } else {
                self.fault.stop(&self.ctx).await
            }
        };
        let result = match timeout(self.action_timeout, action).await {
            Ok(result) => result,
            Err(_) => Err(NemesisError::Timeout(self.action_timeout)),
        };

        match result {
            Ok(status) => {
                info!(nemesis = %self.fault.name(), event = f, status = %status.to_value(), "Nemesis event applied");
                if !status.is_noop() {
                    if event.is_apply() {
                        summary.applied += 1;
                    } else {
                        summary.reverted += 1;
                    }
                }
                if let FaultStatus::Partial { failures, .. } = &status {
                    warn!(nemesis = %self.fault.name(), event = f, failures = ?failures, "Nemesis event partially applied");
                }
                self.record(Operation::nemesis(OpType::Info, f, status.to_value()));
            }
            Err(e) => {
                error!(nemesis = %self.fault.name(), event = f, error = %e, "Nemesis event failed");
                summary.errors += 1;
                let mut op = Operation::nemesis(OpType::Info, f, Value::Null);
                op.error = Some(json!(["nemesis-error", e.to_string()]));
                self.record(op);
            }
        }
    }

    fn record(&self, op: Operation) {
        if let Err(e) = self.recorder.record(op) {
            warn!(error = %e, "Dropping nemesis event");
        }
    }
}
