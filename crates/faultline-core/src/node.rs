//! Node and process identification types.
//!
//! Nodes are the database hosts of the cluster under test. Processes are the
//! logical client actors that issue operations; each client process is pinned
//! to one node for the lifetime of its connection. The nemesis is a process
//! of its own so fault events can share the history with client operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a database node, usually its hostname.
///
/// # Examples
///
/// ```
/// use faultline_core::node::NodeId;
///
/// let node = NodeId::new("n1");
/// assert_eq!(node.as_str(), "n1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Creates a new NodeId from a hostname.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the hostname.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Identifier of a client process.
///
/// Processes execute operations strictly sequentially. A process that sees an
/// indeterminate outcome is retired by the generator and replaced by a fresh
/// one, so process ids grow over a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Creates a new ProcessId with the given value.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the inner value of the ProcessId.
    #[inline]
    pub const fn inner(self) -> u32 {
        self.0
    }

    /// Picks the node this process binds to, round-robin over `node_count`.
    ///
    /// Returns `None` when there are no nodes.
    pub fn node_index(self, node_count: usize) -> Option<usize> {
        if node_count == 0 {
            None
        } else {
            Some(self.0 as usize % node_count)
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Process({})", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// The actor that produced a history entry.
///
/// Serialized as the bare process number for clients and as the string
/// `"nemesis"` for fault events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Actor {
    /// A workload client process.
    Client(ProcessId),
    /// The fault injector.
    Nemesis(NemesisTag),
}

/// Marker serialized as `"nemesis"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NemesisTag {
    /// The only value.
    Nemesis,
}

impl Actor {
    /// The nemesis actor.
    pub const NEMESIS: Actor = Actor::Nemesis(NemesisTag::Nemesis);

    /// Returns the client process id, if this is a client.
    pub fn process(&self) -> Option<ProcessId> {
        match self {
            Actor::Client(p) => Some(*p),
            Actor::Nemesis(_) => None,
        }
    }

    /// Returns true for the nemesis actor.
    pub fn is_nemesis(&self) -> bool {
        matches!(self, Actor::Nemesis(_))
    }
}

impl From<ProcessId> for Actor {
    fn from(p: ProcessId) -> Self {
        Actor::Client(p)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Client(p) => write!(f, "{}", p.0),
            Actor::Nemesis(_) => f.write_str("nemesis"),
        }
    }
}
