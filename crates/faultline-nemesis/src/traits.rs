//! Core traits for fault injection.
//!
//! This module defines the [`Fault`] trait every catalog entry implements and
//! the [`FaultStatus`] it reports back to the nemesis runner.

use std::sync::Arc;

use async_trait::async_trait;
use faultline_core::NodeId;
use serde::Serialize;
use serde_json::Value;

use crate::context::FaultContext;
use crate::error::Result;

/// Core trait for fault implementations.
///
/// A fault is constructed once per run and keeps track of the nodes it is
/// currently active on.
///
/// # Lifecycle
///
/// - `start` applies the fault. Calling it on an already started fault does
///   nothing and returns [`FaultStatus::AlreadyActive`]. A target that is
///   already in the faulted condition (e.g. a process that is already dead)
///   is not an error.
/// - `stop` restores the prior condition before returning. Calling it on a
///   stopped fault does nothing and returns [`FaultStatus::NotActive`].
///
/// Composite faults apply their parts independently: a failing part is
/// logged and reported as [`FaultStatus::Partial`], the remaining parts
/// still run.
#[async_trait]
pub trait Fault: Send + Sync {
    /// Returns the name of this fault, as used in the nemesis registry.
    fn name(&self) -> &str;

    /// Returns a human-readable description of this fault.
    ///
    /// Default implementation returns the fault name.
    fn description(&self) -> &str {
        self.name()
    }

    /// Applies the fault.
    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus>;

    /// Reverts the fault.
    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus>;

    /// Returns whether the fault is currently applied.
    fn is_active(&self) -> bool;
}

/// A shared fault for dynamic dispatch.
pub type SharedFault = Arc<dyn Fault>;

/// What a `start` or `stop` call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum FaultStatus {
    /// The fault was applied to the targets.
    Applied {
        /// Affected nodes.
        targets: Vec<NodeId>,
        /// Fault-specific detail, e.g. the skew applied per node.
        #[serde(skip_serializing_if = "Value::is_null")]
        detail: Value,
    },
    /// The fault was reverted on the targets.
    Recovered {
        /// Affected nodes.
        targets: Vec<NodeId>,
    },
    /// Some parts failed; the others were applied.
    Partial {
        /// Affected nodes.
        targets: Vec<NodeId>,
        /// One message per failed part.
        failures: Vec<String>,
    },
    /// `start` on a fault that is already active.
    AlreadyActive,
    /// `stop` on a fault that is not active.
    NotActive,
    /// The fault does nothing.
    Noop,
}

impl FaultStatus {
    /// Builds `Applied` without detail.
    pub fn applied(targets: Vec<NodeId>) -> Self {
        FaultStatus::Applied {
            targets,
            detail: Value::Null,
        }
    }

    /// Builds `Recovered`, or `Partial` if any part failed.
    pub fn recovered(targets: Vec<NodeId>, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            FaultStatus::Recovered { targets }
        } else {
            FaultStatus::Partial { targets, failures }
        }
    }

    /// Builds `Applied`, or `Partial` if any part failed.
    pub fn applied_with(targets: Vec<NodeId>, detail: Value, failures: Vec<String>) -> Self {
        if failures.is_empty() {
            FaultStatus::Applied { targets, detail }
        } else {
            FaultStatus::Partial { targets, failures }
        }
    }

    /// Returns true if the call changed nothing.
    pub fn is_noop(&self) -> bool {
        matches!(
            self,
            FaultStatus::AlreadyActive | FaultStatus::NotActive | FaultStatus::Noop
        )
    }

    /// Returns the affected nodes.
    pub fn targets(&self) -> &[NodeId] {
        match self {
            FaultStatus::Applied { targets, .. }
            | FaultStatus::Recovered { targets }
            | FaultStatus::Partial { targets, .. } => targets,
            _ => &[],
        }
    }

    /// Renders the status for the history.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
