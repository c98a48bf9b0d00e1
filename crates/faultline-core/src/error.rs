//! Error types for history recording and storage.

use thiserror::Error;

/// Errors that can occur while recording, saving or loading a history.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Failed to serialize or deserialize an entry.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read or write history data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored history could not be parsed.
    #[error("corrupted history at line {line}: {reason}")]
    Corrupted { line: usize, reason: String },

    /// The recorder was already sealed.
    #[error("history is sealed")]
    Sealed,
}

impl HistoryError {
    /// Creates a new corrupted history error.
    pub fn corrupted(line: usize, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            line,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_error_display() {
        let err = HistoryError::corrupted(7, "missing field `f`");
        assert_eq!(err.to_string(), "corrupted history at line 7: missing field `f`");
        assert_eq!(HistoryError::Sealed.to_string(), "history is sealed");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HistoryError = io_err.into();
        assert!(matches!(err, HistoryError::Io(_)));
    }
}
