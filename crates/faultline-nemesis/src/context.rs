//! Fault injection context.
//!
//! A [`FaultContext`] is shared by every fault of a run. It holds the node
//! list, the controller and partition provider, the recovery await budget and
//! the run's random source, so that a seeded run picks the same targets.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use faultline_core::NodeId;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::{ClusterController, PartitionProvider, Role};
use crate::error::{NemesisError, Result};

/// How long recovery waits for a role to answer after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwaitPolicy {
    /// Number of readiness probes before giving up.
    pub attempts: u32,
    /// Delay between probes in milliseconds.
    pub delay_ms: u64,
}

impl Default for AwaitPolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            delay_ms: 1000,
        }
    }
}

impl AwaitPolicy {
    /// Returns the probe delay as a Duration.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Shared state every fault operates on.
pub struct FaultContext {
    nodes: Vec<NodeId>,
    controller: Arc<dyn ClusterController>,
    net: Arc<dyn PartitionProvider>,
    await_policy: AwaitPolicy,
    rng: Mutex<ChaCha8Rng>,
}

impl FaultContext {
    /// Creates a context over `nodes` with an entropy-seeded random source.
    pub fn new(
        nodes: Vec<NodeId>,
        controller: Arc<dyn ClusterController>,
        net: Arc<dyn PartitionProvider>,
    ) -> Self {
        Self {
            nodes,
            controller,
            net,
            await_policy: AwaitPolicy::default(),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(rand::random())),
        }
    }

    /// Reseeds the random source.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Sets the recovery await budget.
    pub fn with_await_policy(mut self, policy: AwaitPolicy) -> Self {
        self.await_policy = policy;
        self
    }

    /// Returns the cluster nodes.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Returns the cluster controller.
    pub fn controller(&self) -> &dyn ClusterController {
        self.controller.as_ref()
    }

    /// Returns the partition provider.
    pub fn net(&self) -> &dyn PartitionProvider {
        self.net.as_ref()
    }

    /// Runs `f` with exclusive access to the random source.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }

    /// Picks one node uniformly.
    pub fn random_node(&self) -> Result<NodeId> {
        self.with_rng(|rng| self.nodes.choose(rng).cloned())
            .ok_or(NemesisError::NoNodes)
    }

    /// Picks a non-empty random subset of the nodes.
    pub fn random_subset(&self) -> Result<Vec<NodeId>> {
        if self.nodes.is_empty() {
            return Err(NemesisError::NoNodes);
        }
        Ok(self.with_rng(|rng| {
            let count = rng.gen_range(1..=self.nodes.len());
            let mut subset: Vec<NodeId> =
                self.nodes.choose_multiple(rng, count).cloned().collect();
            subset.sort();
            subset
        }))
    }

    /// Probes `role` on `node` until it answers or the await budget runs out.
    pub async fn await_role(&self, node: &NodeId, role: Role) -> Result<()> {
        let attempts = self.await_policy.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.controller.await_role(node, role).await {
                Ok(()) => {
                    debug!(node = %node, role = %role, attempt, "Role is ready");
                    return Ok(());
                }
                Err(e) => {
                    debug!(node = %node, role = %role, attempt, error = %e, "Role not ready yet");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.await_policy.delay()).await;
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        warn!(node = %node, role = %role, attempts, reason = %reason, "Role did not become ready");
        Err(NemesisError::RecoveryFailed(format!(
            "{role} on {node} not ready after {attempts} probes: {reason}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunController;
    use crate::controller::Signal;

    fn context(nodes: &[&str]) -> (Arc<DryRunController>, FaultContext) {
        let nodes: Vec<NodeId> = nodes.iter().map(|n| NodeId::from(*n)).collect();
        let ctl = Arc::new(DryRunController::new(&nodes));
        let ctx = FaultContext::new(nodes, ctl.clone(), ctl.clone())
            .with_seed(7)
            .with_await_policy(AwaitPolicy {
                attempts: 3,
                delay_ms: 10,
            });
        (ctl, ctx)
    }

    #[test]
    fn test_random_subset_is_non_empty_and_sorted() {
        let (_, ctx) = context(&["n1", "n2", "n3", "n4", "n5"]);
        for _ in 0..50 {
            let subset = ctx.random_subset().unwrap();
            assert!(!subset.is_empty() && subset.len() <= 5);
            assert!(subset.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_seeded_choices_repeat() {
        let (_, a) = context(&["n1", "n2", "n3"]);
        let (_, b) = context(&["n1", "n2", "n3"]);
        let picks_a: Vec<_> = (0..10).map(|_| a.random_node().unwrap()).collect();
        let picks_b: Vec<_> = (0..10).map(|_| b.random_node().unwrap()).collect();
        assert_eq!(picks_a, picks_b);
    }

    #[test]
    fn test_no_nodes() {
        let (_, ctx) = context(&[]);
        assert!(matches!(ctx.random_node(), Err(NemesisError::NoNodes)));
        assert!(matches!(ctx.random_subset(), Err(NemesisError::NoNodes)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_role_budget() {
        let (ctl, ctx) = context(&["n1"]);
        let n1 = NodeId::from("n1");
        ctl.stop_tserver(&n1, Signal::Kill).await.unwrap();
        assert!(matches!(
            ctx.await_role(&n1, Role::TServer).await,
            Err(NemesisError::RecoveryFailed(_))
        ));
        assert_eq!(ctl.calls_for("await_tservers").len(), 3);

        ctl.start_tserver(&n1).await.unwrap();
        ctx.await_role(&n1, Role::TServer).await.unwrap();
    }
}
