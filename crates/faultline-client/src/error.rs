//! Error types for the client runtime.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors raised by a database driver, already sorted into the kinds the
/// runtime distinguishes. See [`classify`](crate::classify::classify) for
/// what each kind turns into.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// Transient conflict; the operation did not apply and may be retried.
    #[error("try again: {0}")]
    TryAgain(String),

    /// The transaction was rolled back (serialization failure).
    #[error("transaction rolled back: {0}")]
    Rollback(String),

    /// An error reported for one statement of a batch.
    #[error("batch: {0}")]
    Batch(Box<DriverError>),

    /// Aborted because of a conflicting transaction.
    #[error("conflicting transaction: {0}")]
    ConflictingTransaction(String),

    /// The catalog changed underneath the transaction.
    #[error("catalog version mismatch: {0}")]
    CatalogVersionMismatch(String),

    /// The operation outlived its server-side deadline.
    #[error("operation expired: {0}")]
    OperationExpired(String),

    /// The connection exists but the server cannot serve it yet.
    #[error("connection not ready: {0}")]
    ConnectionNotReady(String),

    /// The connection broke while a request was in flight.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No connection could be established.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The call did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Anything the harness does not recognise.
    #[error("driver error: {0}")]
    Other(String),
}

impl DriverError {
    /// Returns the machine-readable kind used as the first element of
    /// recorded error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            DriverError::TryAgain(_) => "try-again",
            DriverError::Rollback(_) => "rollback",
            DriverError::Batch(_) => "batch",
            DriverError::ConflictingTransaction(_) => "conflicting-transaction",
            DriverError::CatalogVersionMismatch(_) => "catalog-version-mismatch",
            DriverError::OperationExpired(_) => "operation-expired",
            DriverError::ConnectionNotReady(_) => "connection-not-ready",
            DriverError::ConnectionClosed(_) => "connection-closed",
            DriverError::ConnectionRefused(_) => "connection-refused",
            DriverError::Timeout(_) => "timeout",
            DriverError::Other(_) => "driver-error",
        }
    }

    /// Returns the driver message, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            DriverError::TryAgain(m)
            | DriverError::Rollback(m)
            | DriverError::ConflictingTransaction(m)
            | DriverError::CatalogVersionMismatch(m)
            | DriverError::OperationExpired(m)
            | DriverError::ConnectionNotReady(m)
            | DriverError::ConnectionClosed(m)
            | DriverError::ConnectionRefused(m)
            | DriverError::Other(m) => Some(m.clone()),
            DriverError::Batch(inner) => inner.message(),
            DriverError::Timeout(_) => None,
        }
    }

    /// Wraps an error as reported for a batch statement.
    pub fn batch(inner: DriverError) -> Self {
        DriverError::Batch(Box::new(inner))
    }
}

/// Errors of the client lifecycle outside `invoke`.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Opening a connection failed.
    #[error("failed to connect to {node}: {source}")]
    Connect {
        /// Node that could not be reached.
        node: String,
        /// The driver error.
        #[source]
        source: DriverError,
    },

    /// The workload's setup failed.
    #[error("setup failed: {0}")]
    Setup(#[source] DriverError),

    /// The workload's teardown failed.
    #[error("teardown failed: {0}")]
    Teardown(#[source] DriverError),

    /// The call is not allowed in the current state.
    #[error("invalid client state: {0}")]
    InvalidState(String),
}

/// Result type alias for client lifecycle calls.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_messages() {
        let err = DriverError::batch(DriverError::Rollback("conflict".into()));
        assert_eq!(err.kind(), "batch");
        assert_eq!(err.message().as_deref(), Some("conflict"));
        assert_eq!(err.to_string(), "batch: transaction rolled back: conflict");
        assert_eq!(DriverError::Timeout(Duration::from_secs(1)).message(), None);
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Connect {
            node: "n1".into(),
            source: DriverError::ConnectionRefused("down".into()),
        };
        assert_eq!(err.to_string(), "failed to connect to n1: connection refused: down");
    }
}
