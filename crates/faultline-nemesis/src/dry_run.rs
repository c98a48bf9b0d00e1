//! A recording, in-memory cluster controller.
//!
//! [`DryRunController`] keeps a model of process states, clock offsets and
//! drop rules per node and appends every call to a log. It never touches a
//! host, which makes it the controller of choice for `--dry-run` runs and for
//! tests. Failures can be scripted per node and action.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use faultline_core::NodeId;
use tracing::debug;

use crate::controller::{ClusterController, Grudge, PartitionProvider, Role, Signal};
use crate::error::{NemesisError, Result};

/// Modelled state of a database process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Serving requests.
    Running,
    /// Not running.
    Stopped,
    /// Suspended with `SIGSTOP`.
    Paused,
}

/// One recorded controller call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerCall {
    /// Controller method name, e.g. `stop_tserver`.
    pub action: &'static str,
    /// Target node.
    pub node: NodeId,
    /// Extra arguments, rendered.
    pub detail: String,
}

impl fmt::Display for ControllerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{} {}", self.action, self.node)
        } else {
            write!(f, "{} {} {}", self.action, self.node, self.detail)
        }
    }
}

#[derive(Debug, Default)]
struct DryRunState {
    calls: Vec<ControllerCall>,
    processes: BTreeMap<(NodeId, Role), ProcessState>,
    clocks: BTreeMap<NodeId, i64>,
    grudge: Grudge,
    failures: BTreeMap<(NodeId, &'static str), u32>,
    warming: BTreeMap<(NodeId, Role), u32>,
    startup_probes: u32,
}

impl DryRunState {
    fn process(&mut self, node: &NodeId, role: Role) -> &mut ProcessState {
        self.processes
            .entry((node.clone(), role))
            .or_insert(ProcessState::Stopped)
    }

    fn start(&mut self, node: &NodeId, role: Role) {
        let probes = self.startup_probes;
        let state = self.process(node, role);
        if *state == ProcessState::Stopped {
            *state = ProcessState::Running;
            self.warming.insert((node.clone(), role), probes);
        }
    }

    fn deliver(&mut self, node: &NodeId, role: Role, signal: Signal) {
        let state = self.process(node, role);
        *state = match (*state, signal) {
            (_, Signal::Term | Signal::Kill) => ProcessState::Stopped,
            (ProcessState::Running, Signal::Stop) => ProcessState::Paused,
            (ProcessState::Paused, Signal::Cont) => ProcessState::Running,
            (current, _) => current,
        };
    }

    fn probe(&mut self, node: &NodeId, role: Role) -> Result<()> {
        match *self.process(node, role) {
            ProcessState::Running => {}
            ProcessState::Stopped => {
                return Err(NemesisError::controller(node, "await", format!("{role} not running")));
            }
            ProcessState::Paused => {
                return Err(NemesisError::controller(node, "await", format!("{role} is paused")));
            }
        }
        match self.warming.get_mut(&(node.clone(), role)) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(NemesisError::controller(node, "await", format!("{role} still starting")))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory controller that records every call.
#[derive(Debug, Default)]
pub struct DryRunController {
    state: Mutex<DryRunState>,
}

impl DryRunController {
    /// Creates a controller with both roles running on every node.
    pub fn new(nodes: &[NodeId]) -> Self {
        let mut state = DryRunState::default();
        for node in nodes {
            for role in Role::ALL {
                state
                    .processes
                    .insert((node.clone(), role), ProcessState::Running);
            }
            state.clocks.insert(node.clone(), 0);
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Makes every freshly started process fail `probes` readiness checks
    /// before it reports ready.
    pub fn with_startup_probes(self, probes: u32) -> Self {
        self.lock().startup_probes = probes;
        self
    }

    /// Makes the next `times` calls of `action` on `node` fail.
    pub fn fail_next(&self, node: &NodeId, action: &'static str, times: u32) {
        self.lock().failures.insert((node.clone(), action), times);
    }

    /// Returns every call recorded so far.
    pub fn calls(&self) -> Vec<ControllerCall> {
        self.lock().calls.clone()
    }

    /// Returns the recorded calls of one action.
    pub fn calls_for(&self, action: &str) -> Vec<ControllerCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    /// Returns the modelled state of a role on a node.
    pub fn process_state(&self, node: &NodeId, role: Role) -> ProcessState {
        self.lock()
            .processes
            .get(&(node.clone(), role))
            .copied()
            .unwrap_or(ProcessState::Stopped)
    }

    /// Returns the accumulated clock offset of a node in milliseconds.
    pub fn clock_offset(&self, node: &NodeId) -> i64 {
        self.lock().clocks.get(node).copied().unwrap_or(0)
    }

    /// Returns the active drop rules.
    pub fn grudge(&self) -> Grudge {
        self.lock().grudge.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a call and applies any scripted failure for it.
    fn enter(
        &self,
        action: &'static str,
        node: &NodeId,
        detail: String,
    ) -> Result<MutexGuard<'_, DryRunState>> {
        let mut state = self.lock();
        debug!(action = action, node = %node, detail = %detail, "Dry-run controller call");
        state.calls.push(ControllerCall {
            action,
            node: node.clone(),
            detail,
        });
        if let Some(left) = state.failures.get_mut(&(node.clone(), action)) {
            if *left > 0 {
                *left -= 1;
                return Err(NemesisError::controller(node, action, "injected failure"));
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl ClusterController for DryRunController {
    async fn install(&self, node: &NodeId) -> Result<()> {
        self.enter("install", node, String::new())?;
        Ok(())
    }

    async fn start_master(&self, node: &NodeId) -> Result<()> {
        self.enter("start_master", node, String::new())?
            .start(node, Role::Master);
        Ok(())
    }

    async fn start_tserver(&self, node: &NodeId) -> Result<()> {
        self.enter("start_tserver", node, String::new())?
            .start(node, Role::TServer);
        Ok(())
    }

    async fn stop_master(&self, node: &NodeId, signal: Signal) -> Result<()> {
        self.enter("stop_master", node, signal.to_string())?
            .deliver(node, Role::Master, signal);
        Ok(())
    }

    async fn stop_tserver(&self, node: &NodeId, signal: Signal) -> Result<()> {
        self.enter("stop_tserver", node, signal.to_string())?
            .deliver(node, Role::TServer, signal);
        Ok(())
    }

    async fn signal(&self, node: &NodeId, role: Role, signal: Signal) -> Result<()> {
        self.enter("signal", node, format!("{role} {signal}"))?
            .deliver(node, role, signal);
        Ok(())
    }

    async fn wipe(&self, node: &NodeId) -> Result<()> {
        self.enter("wipe", node, String::new())?;
        Ok(())
    }

    async fn await_masters(&self, node: &NodeId) -> Result<()> {
        self.enter("await_masters", node, String::new())?
            .probe(node, Role::Master)
    }

    async fn await_tservers(&self, node: &NodeId) -> Result<()> {
        self.enter("await_tservers", node, String::new())?
            .probe(node, Role::TServer)
    }

    async fn bump_clock(&self, node: &NodeId, delta_ms: i64) -> Result<()> {
        let mut state = self.enter("bump_clock", node, delta_ms.to_string())?;
        *state.clocks.entry(node.clone()).or_insert(0) += delta_ms;
        Ok(())
    }

    async fn reset_clock(&self, node: &NodeId) -> Result<()> {
        self.enter("reset_clock", node, String::new())?
            .clocks
            .insert(node.clone(), 0);
        Ok(())
    }
}

#[async_trait]
impl PartitionProvider for DryRunController {
    async fn drop_all(&self, grudge: &Grudge) -> Result<()> {
        let mut failures = Vec::new();
        for (node, frenemies) in grudge {
            let detail = frenemies
                .iter()
                .map(NodeId::as_str)
                .collect::<Vec<_>>()
                .join(",");
            match self.enter("drop_all", node, detail) {
                Ok(mut state) => {
                    state
                        .grudge
                        .entry(node.clone())
                        .or_default()
                        .extend(frenemies.iter().cloned());
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NemesisError::Network(failures.join("; ")))
        }
    }

    async fn heal(&self, nodes: &[NodeId]) -> Result<()> {
        let mut failures = Vec::new();
        for node in nodes {
            match self.enter("heal", node, String::new()) {
                Ok(mut state) => {
                    state.grudge.remove(node);
                }
                Err(e) => failures.push(e.to_string()),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NemesisError::Network(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn n(name: &str) -> NodeId {
        NodeId::from(name)
    }

    #[tokio::test]
    async fn test_process_lifecycle() {
        let ctl = DryRunController::new(&[n("n1"), n("n2")]);
        assert_eq!(ctl.process_state(&n("n1"), Role::TServer), ProcessState::Running);

        ctl.stop_tserver(&n("n1"), Signal::Kill).await.unwrap();
        assert_eq!(ctl.process_state(&n("n1"), Role::TServer), ProcessState::Stopped);
        // Stopping again is harmless.
        ctl.stop_tserver(&n("n1"), Signal::Kill).await.unwrap();
        assert!(ctl.await_tservers(&n("n1")).await.is_err());

        ctl.start_tserver(&n("n1")).await.unwrap();
        ctl.await_tservers(&n("n1")).await.unwrap();

        ctl.signal(&n("n2"), Role::Master, Signal::Stop).await.unwrap();
        assert_eq!(ctl.process_state(&n("n2"), Role::Master), ProcessState::Paused);
        ctl.signal(&n("n2"), Role::Master, Signal::Cont).await.unwrap();
        assert_eq!(ctl.process_state(&n("n2"), Role::Master), ProcessState::Running);

        assert_eq!(ctl.calls_for("stop_tserver").len(), 2);
        assert_eq!(ctl.calls()[0].to_string(), "stop_tserver n1 SIGKILL");
    }

    #[tokio::test]
    async fn test_startup_probes_and_injected_failures() {
        let ctl = DryRunController::new(&[n("n1")]).with_startup_probes(2);
        ctl.stop_master(&n("n1"), Signal::Term).await.unwrap();
        ctl.start_master(&n("n1")).await.unwrap();
        assert!(ctl.await_masters(&n("n1")).await.is_err());
        assert!(ctl.await_masters(&n("n1")).await.is_err());
        ctl.await_masters(&n("n1")).await.unwrap();

        ctl.fail_next(&n("n1"), "reset_clock", 1);
        assert!(ctl.reset_clock(&n("n1")).await.is_err());
        ctl.reset_clock(&n("n1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_clock_and_partition_model() {
        let ctl = DryRunController::new(&[n("n1"), n("n2")]);
        ctl.bump_clock(&n("n1"), 40).await.unwrap();
        ctl.bump_clock(&n("n1"), -15).await.unwrap();
        assert_eq!(ctl.clock_offset(&n("n1")), 25);
        ctl.reset_clock(&n("n1")).await.unwrap();
        assert_eq!(ctl.clock_offset(&n("n1")), 0);

        let mut grudge = Grudge::new();
        grudge.insert(n("n1"), BTreeSet::from([n("n2")]));
        ctl.drop_all(&grudge).await.unwrap();
        assert_eq!(ctl.grudge(), grudge);
        ctl.heal(&[n("n1"), n("n2")]).await.unwrap();
        assert!(ctl.grudge().is_empty());
    }
}
