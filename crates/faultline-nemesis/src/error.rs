//! Error types for the nemesis.

use std::time::Duration;

use faultline_core::NodeId;
use thiserror::Error;

/// Result type alias for nemesis operations.
pub type Result<T> = std::result::Result<T, NemesisError>;

/// Errors that can occur while injecting or recovering faults.
#[derive(Debug, Error)]
pub enum NemesisError {
    /// No nemesis is registered under this name.
    #[error("Unknown nemesis: {0}")]
    UnknownNemesis(String),

    /// The fault context has no nodes to target.
    #[error("No nodes available for fault injection")]
    NoNodes,

    /// A remote command exited unsuccessfully.
    #[error("Command failed on {node}: {command} - {reason}")]
    CommandFailed {
        node: NodeId,
        command: String,
        reason: String,
    },

    /// A cluster controller action failed.
    #[error("Controller action {action} failed on {node}: {reason}")]
    Controller {
        node: NodeId,
        action: String,
        reason: String,
    },

    /// A partition provider action failed.
    #[error("Network fault error: {0}")]
    Network(String),

    /// Recovery from a fault failed.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An I/O error occurred while running a command.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NemesisError {
    /// Creates a new command failed error.
    pub fn command_failed(
        node: &NodeId,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            node: node.clone(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new controller error.
    pub fn controller(node: &NodeId, action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Controller {
            node: node.clone(),
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// Checks if retrying the same action may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NemesisError::Timeout(_)
                | NemesisError::CommandFailed { .. }
                | NemesisError::Controller { .. }
                | NemesisError::Network(_)
                | NemesisError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let node = NodeId::new("n2");
        let err = NemesisError::controller(&node, "start_tserver", "exit status 1");
        assert_eq!(
            err.to_string(),
            "Controller action start_tserver failed on n2: exit status 1"
        );
        assert!(err.is_transient());
        assert!(!NemesisError::UnknownNemesis("x".into()).is_transient());
    }
}
