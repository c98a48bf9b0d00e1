//! Cluster control interfaces.
//!
//! Faults never talk to hosts directly. Process faults go through a
//! [`ClusterController`], partitions through a [`PartitionProvider`]. The
//! harness ships a shell-backed implementation
//! ([`ShellController`](crate::distribution::ShellController)) and a recording
//! one ([`DryRunController`](crate::dry_run::DryRunController)).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use faultline_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A database server role running on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Metadata/catalog server.
    Master,
    /// Tablet (data) server.
    #[serde(rename = "tserver")]
    TServer,
}

impl Role {
    /// Both roles, master first.
    pub const ALL: [Role; 2] = [Role::Master, Role::TServer];

    /// Returns the short name used in nemesis names and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::TServer => "tserver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unix signals the faults send to database processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// SIGTERM (15) - Graceful termination request.
    Term,
    /// SIGKILL (9) - Forceful termination (cannot be caught).
    Kill,
    /// SIGSTOP (19) - Stop/pause process.
    Stop,
    /// SIGCONT (18) - Continue stopped process.
    Cont,
}

impl Signal {
    /// Returns the signal number.
    pub fn number(&self) -> i32 {
        match self {
            Signal::Term => 15,
            Signal::Kill => 9,
            Signal::Stop => 19,
            Signal::Cont => 18,
        }
    }

    /// Returns the signal name (without SIG prefix).
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
            Signal::Stop => "STOP",
            Signal::Cont => "CONT",
        }
    }

    /// Returns whether this signal can be caught/handled by the process.
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Signal::Kill | Signal::Stop)
    }

    /// Returns whether this signal terminates the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Signal::Term | Signal::Kill)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// Who refuses traffic from whom: each key drops all packets coming from the
/// nodes in its value set.
pub type Grudge = BTreeMap<NodeId, BTreeSet<NodeId>>;

/// Lifecycle control over the database processes of a cluster.
///
/// `stop_*` must be idempotent: stopping a role that is not running is not
/// an error. `await_*` succeed once the role on that node answers requests.
#[async_trait]
pub trait ClusterController: Send + Sync {
    /// Installs the database on a node.
    async fn install(&self, node: &NodeId) -> Result<()>;

    /// Starts the master process on a node.
    async fn start_master(&self, node: &NodeId) -> Result<()>;

    /// Starts the tablet server process on a node.
    async fn start_tserver(&self, node: &NodeId) -> Result<()>;

    /// Stops the master process on a node with the given signal.
    async fn stop_master(&self, node: &NodeId, signal: Signal) -> Result<()>;

    /// Stops the tablet server process on a node with the given signal.
    async fn stop_tserver(&self, node: &NodeId, signal: Signal) -> Result<()>;

    /// Sends a non-terminating signal (`STOP`/`CONT`) to a role's process.
    async fn signal(&self, node: &NodeId, role: Role, signal: Signal) -> Result<()>;

    /// Removes all data and logs from a node.
    async fn wipe(&self, node: &NodeId) -> Result<()>;

    /// Waits until the masters are reachable from this node.
    async fn await_masters(&self, node: &NodeId) -> Result<()>;

    /// Waits until the tablet servers are reachable from this node.
    async fn await_tservers(&self, node: &NodeId) -> Result<()>;

    /// Shifts the node's wall clock by `delta_ms` milliseconds.
    async fn bump_clock(&self, node: &NodeId, delta_ms: i64) -> Result<()>;

    /// Resynchronizes the node's wall clock with a time source.
    async fn reset_clock(&self, node: &NodeId) -> Result<()>;

    /// Starts the given role on a node.
    async fn start_role(&self, node: &NodeId, role: Role) -> Result<()> {
        match role {
            Role::Master => self.start_master(node).await,
            Role::TServer => self.start_tserver(node).await,
        }
    }

    /// Stops the given role on a node.
    async fn stop_role(&self, node: &NodeId, role: Role, signal: Signal) -> Result<()> {
        match role {
            Role::Master => self.stop_master(node, signal).await,
            Role::TServer => self.stop_tserver(node, signal).await,
        }
    }

    /// Waits for the given role to become reachable.
    async fn await_role(&self, node: &NodeId, role: Role) -> Result<()> {
        match role {
            Role::Master => self.await_masters(node).await,
            Role::TServer => self.await_tservers(node).await,
        }
    }
}

/// Network-level traffic control.
#[async_trait]
pub trait PartitionProvider: Send + Sync {
    /// Installs drop rules so that every node in the grudge refuses traffic
    /// from the nodes it holds a grudge against.
    async fn drop_all(&self, grudge: &Grudge) -> Result<()>;

    /// Removes every drop rule on the given nodes.
    async fn heal(&self, nodes: &[NodeId]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_properties() {
        assert_eq!(Signal::Kill.number(), 9);
        assert_eq!(Signal::Term.to_string(), "SIGTERM");
        assert!(Signal::Term.is_catchable());
        assert!(!Signal::Stop.is_catchable());
        assert!(Signal::Kill.is_fatal());
        assert!(!Signal::Cont.is_fatal());
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::TServer).unwrap(), "\"tserver\"");
        assert_eq!(serde_json::to_string(&Role::Master).unwrap(), "\"master\"");
        assert_eq!(Role::TServer.to_string(), "tserver");
    }
}
