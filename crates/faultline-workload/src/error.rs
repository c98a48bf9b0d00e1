//! Error types for workloads.

use thiserror::Error;

/// Result type alias for workload operations.
pub type Result<T> = std::result::Result<T, WorkloadError>;

/// Errors that can occur while building a workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// No workload is registered under this name.
    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    /// The workload configuration is unusable.
    #[error("invalid workload configuration: {0}")]
    InvalidConfiguration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkloadError::UnknownWorkload("counter".into());
        assert_eq!(err.to_string(), "unknown workload: counter");
    }
}
