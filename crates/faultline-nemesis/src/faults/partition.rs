//! Network partition faults.
//!
//! A partition is described as a [`Grudge`]: for each node, the set of nodes
//! whose traffic it drops. The partition provider installs the drop rules on
//! `start`; `stop` heals every node and waits until the database answers
//! on each of them again.

use std::collections::BTreeSet;

use async_trait::async_trait;
use faultline_core::NodeId;
use rand::Rng;
use rand::seq::SliceRandom;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::FaultContext;
use crate::controller::{Grudge, Role};
use crate::error::Result;
use crate::traits::{Fault, FaultStatus};

/// Builds a grudge in which every component is cut off from all others.
pub fn complete_grudge(components: &[Vec<NodeId>]) -> Grudge {
    let all: BTreeSet<&NodeId> = components.iter().flatten().collect();
    let mut grudge = Grudge::new();
    for component in components {
        let own: BTreeSet<&NodeId> = component.iter().collect();
        let others: BTreeSet<NodeId> = all.difference(&own).map(|n| (*n).clone()).collect();
        for node in component {
            grudge.insert(node.clone(), others.clone());
        }
    }
    grudge
}

/// Builds a ring of overlapping majorities.
///
/// Walking the ring, every window of `n / 2 + 1` consecutive nodes is one
/// majority; the node in the middle of the window sees only that majority.
/// Every node sees a majority, and no two nodes see the same one.
pub fn majorities_ring(ring: &[NodeId]) -> Grudge {
    let n = ring.len();
    let m = n / 2 + 1;
    let all: BTreeSet<&NodeId> = ring.iter().collect();
    let mut grudge = Grudge::new();
    for i in 0..n {
        let window: BTreeSet<&NodeId> = (0..m).map(|k| &ring[(i + k) % n]).collect();
        let center = &ring[(i + m / 2) % n];
        let dropped = all.difference(&window).map(|n| (*n).clone()).collect();
        grudge.insert(center.clone(), dropped);
    }
    grudge
}

/// How the nodes are split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioner {
    /// Two random halves, the first one smaller for odd node counts.
    RandomHalves,
    /// One random node isolated from the rest.
    RandomNode,
    /// Overlapping majorities arranged in a random ring.
    MajoritiesRing,
}

impl Partitioner {
    /// Returns the registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Partitioner::RandomHalves => "partition-random-halves",
            Partitioner::RandomNode => "partition-random-node",
            Partitioner::MajoritiesRing => "partition-majorities-ring",
        }
    }

    /// Draws a grudge over `nodes`.
    pub fn grudge<R: Rng + ?Sized>(&self, nodes: &[NodeId], rng: &mut R) -> Grudge {
        let mut shuffled = nodes.to_vec();
        shuffled.shuffle(rng);
        match self {
            Partitioner::RandomHalves => {
                let (small, large) = shuffled.split_at(shuffled.len() / 2);
                complete_grudge(&[small.to_vec(), large.to_vec()])
            }
            Partitioner::RandomNode => match shuffled.split_first() {
                Some((isolated, rest)) => complete_grudge(&[vec![isolated.clone()], rest.to_vec()]),
                None => Grudge::new(),
            },
            Partitioner::MajoritiesRing => majorities_ring(&shuffled),
        }
    }
}

/// Partitions the network according to a [`Partitioner`].
#[derive(Debug)]
pub struct Partition {
    partitioner: Partitioner,
    active: Mutex<Option<Grudge>>,
}

impl Partition {
    /// Creates a partition fault.
    pub fn new(partitioner: Partitioner) -> Self {
        Self {
            partitioner,
            active: Mutex::new(None),
        }
    }

    /// Returns the partitioner.
    pub fn partitioner(&self) -> Partitioner {
        self.partitioner
    }
}

#[async_trait]
impl Fault for Partition {
    fn name(&self) -> &str {
        self.partitioner.name()
    }

    fn description(&self) -> &str {
        "Drops network traffic between groups of nodes"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!(fault = self.name(), "Fault already active");
            return Ok(FaultStatus::AlreadyActive);
        }

        let grudge = ctx.with_rng(|rng| self.partitioner.grudge(ctx.nodes(), rng));
        let targets: Vec<NodeId> = grudge
            .iter()
            .filter(|(_, dropped)| !dropped.is_empty())
            .map(|(node, _)| node.clone())
            .collect();
        info!(fault = self.name(), targets = ?targets, "Partitioning network");

        let detail = serde_json::to_value(&grudge).unwrap_or(Value::Null);
        let grudge = active.insert(grudge);
        let mut failures = Vec::new();
        if let Err(e) = ctx.net().drop_all(grudge).await {
            warn!(fault = self.name(), error = %e, "Failed to install some drop rules");
            failures.push(e.to_string());
        }

        Ok(FaultStatus::applied_with(targets, detail, failures))
    }

    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        if active.take().is_none() {
            debug!(fault = self.name(), "Fault not active");
            return Ok(FaultStatus::NotActive);
        }

        info!(fault = self.name(), "Healing network");
        let mut failures = Vec::new();
        if let Err(e) = ctx.net().heal(ctx.nodes()).await {
            warn!(fault = self.name(), error = %e, "Failed to heal some nodes");
            failures.push(e.to_string());
        }
        for node in ctx.nodes() {
            for role in Role::ALL {
                if let Err(e) = ctx.await_role(node, role).await {
                    failures.push(e.to_string());
                }
            }
        }
        Ok(FaultStatus::recovered(ctx.nodes().to_vec(), failures))
    }

    fn is_active(&self) -> bool {
        self.active.try_lock().map_or(true, |a| a.is_some())
    }
}
