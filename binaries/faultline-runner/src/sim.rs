//! Simulated cluster.
//!
//! Couples the dry-run controller with the in-memory database: killing or
//! pausing a tserver, or cutting a node off from the majority, takes that
//! node's database endpoint down until the fault is reverted. This lets a
//! full run, nemesis included, execute on one machine.

use std::sync::Arc;

use async_trait::async_trait;
use faultline_client::MemoryCluster;
use faultline_core::NodeId;
use faultline_nemesis::{
    ClusterController, DryRunController, Grudge, PartitionProvider, ProcessState, Result, Role,
    Signal,
};
use tracing::debug;

/// A [`DryRunController`] whose process and network state drives the
/// availability of a [`MemoryCluster`].
pub struct SimulatedCluster {
    nodes: Vec<NodeId>,
    controller: DryRunController,
    db: MemoryCluster,
}

impl SimulatedCluster {
    /// Creates a healthy cluster of `nodes`.
    pub fn new(nodes: Vec<NodeId>) -> Arc<Self> {
        Arc::new(Self {
            controller: DryRunController::new(&nodes),
            db: MemoryCluster::new(&nodes),
            nodes,
        })
    }

    /// Returns the database.
    pub fn database(&self) -> &MemoryCluster {
        &self.db
    }

    /// Returns the underlying controller.
    pub fn controller(&self) -> &DryRunController {
        &self.controller
    }

    /// Whether `node` can reach a strict majority, itself included.
    fn in_majority(&self, node: &NodeId, grudge: &Grudge) -> bool {
        let blocked = |from: &NodeId, to: &NodeId| grudge.get(from).is_some_and(|g| g.contains(to));
        let reachable = self
            .nodes
            .iter()
            .filter(|peer| *peer == node || (!blocked(node, peer) && !blocked(peer, node)))
            .count();
        reachable * 2 > self.nodes.len()
    }

    /// Recomputes which database endpoints are up.
    fn sync(&self) {
        let grudge = self.controller.grudge();
        for node in &self.nodes {
            let serving = self.controller.process_state(node, Role::TServer) == ProcessState::Running
                && self.in_majority(node, &grudge);
            if serving != self.db.is_available(node) {
                debug!(node = %node, serving, "Simulated node availability changed");
                self.db.set_available(node, serving);
            }
        }
    }

    fn synced<T>(&self, result: Result<T>) -> Result<T> {
        self.sync();
        result
    }
}

#[async_trait]
impl ClusterController for SimulatedCluster {
    async fn install(&self, node: &NodeId) -> Result<()> {
        self.controller.install(node).await
    }

    async fn start_master(&self, node: &NodeId) -> Result<()> {
        let result = self.controller.start_master(node).await;
        self.synced(result)
    }

    async fn start_tserver(&self, node: &NodeId) -> Result<()> {
        let result = self.controller.start_tserver(node).await;
        self.synced(result)
    }

    async fn stop_master(&self, node: &NodeId, signal: Signal) -> Result<()> {
        let result = self.controller.stop_master(node, signal).await;
        self.synced(result)
    }

    async fn stop_tserver(&self, node: &NodeId, signal: Signal) -> Result<()> {
        let result = self.controller.stop_tserver(node, signal).await;
        self.synced(result)
    }

    async fn signal(&self, node: &NodeId, role: Role, signal: Signal) -> Result<()> {
        let result = self.controller.signal(node, role, signal).await;
        self.synced(result)
    }

    async fn wipe(&self, node: &NodeId) -> Result<()> {
        self.controller.wipe(node).await
    }

    async fn await_masters(&self, node: &NodeId) -> Result<()> {
        self.controller.await_masters(node).await
    }

    async fn await_tservers(&self, node: &NodeId) -> Result<()> {
        self.controller.await_tservers(node).await
    }

    async fn bump_clock(&self, node: &NodeId, delta_ms: i64) -> Result<()> {
        self.controller.bump_clock(node, delta_ms).await
    }

    async fn reset_clock(&self, node: &NodeId) -> Result<()> {
        self.controller.reset_clock(node).await
    }
}

#[async_trait]
impl PartitionProvider for SimulatedCluster {
    async fn drop_all(&self, grudge: &Grudge) -> Result<()> {
        let result = self.controller.drop_all(grudge).await;
        self.synced(result)
    }

    async fn heal(&self, nodes: &[NodeId]) -> Result<()> {
        let result = self.controller.heal(nodes).await;
        self.synced(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    fn nodes() -> Vec<NodeId> {
        ["n1", "n2", "n3", "n4", "n5"].into_iter().map(NodeId::from).collect()
    }

    #[tokio::test]
    async fn test_killed_tserver_takes_node_down() {
        let sim = SimulatedCluster::new(nodes());
        let n2 = NodeId::from("n2");

        sim.stop_tserver(&n2, Signal::Kill).await.unwrap();
        assert!(!sim.database().is_available(&n2));
        assert!(sim.database().is_available(&NodeId::from("n1")));

        // Masters do not serve clients.
        sim.stop_master(&NodeId::from("n1"), Signal::Kill).await.unwrap();
        assert!(sim.database().is_available(&NodeId::from("n1")));

        sim.start_tserver(&n2).await.unwrap();
        assert!(sim.database().is_available(&n2));
    }

    #[tokio::test]
    async fn test_paused_tserver_takes_node_down() {
        let sim = SimulatedCluster::new(nodes());
        let n3 = NodeId::from("n3");
        sim.signal(&n3, Role::TServer, Signal::Stop).await.unwrap();
        assert!(!sim.database().is_available(&n3));
        sim.signal(&n3, Role::TServer, Signal::Cont).await.unwrap();
        assert!(sim.database().is_available(&n3));
    }

    #[tokio::test]
    async fn test_minority_side_of_partition_is_down() {
        let sim = SimulatedCluster::new(nodes());
        let minority = [NodeId::from("n1"), NodeId::from("n2")];
        let majority = [NodeId::from("n3"), NodeId::from("n4"), NodeId::from("n5")];

        let mut grudge: Grudge = BTreeMap::new();
        for node in &minority {
            grudge.insert(node.clone(), majority.iter().cloned().collect::<BTreeSet<_>>());
        }
        for node in &majority {
            grudge.insert(node.clone(), minority.iter().cloned().collect::<BTreeSet<_>>());
        }
        sim.drop_all(&grudge).await.unwrap();

        assert!(minority.iter().all(|n| !sim.database().is_available(n)));
        assert!(majority.iter().all(|n| sim.database().is_available(n)));

        sim.heal(&nodes()).await.unwrap();
        assert!(nodes().iter().all(|n| sim.database().is_available(n)));
    }
}
