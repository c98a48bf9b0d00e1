//! Mapping from driver errors to operation outcomes.
//!
//! | Kind | Disposition |
//! |---|---|
//! | try-again | retried by the runtime |
//! | rollback | `fail` |
//! | batch | inner error classified, then tagged `["batch", ...]` |
//! | conflicting-transaction, catalog-version-mismatch, operation-expired | `fail` |
//! | connection-not-ready | short delay, then `fail` |
//! | connection-refused | `fail`, the request never left the client |
//! | connection-closed | `info`, connection invalidated |
//! | timeout | `info`, connection invalidated |
//! | anything else | `info` |

use std::time::Duration;

use faultline_core::Outcome;
use serde_json::{Value, json};

use crate::error::DriverError;

/// What the runtime does with a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Transient: run the operation again after a backoff.
    Retry,
    /// Terminal outcome.
    Complete {
        /// Outcome to record.
        outcome: Outcome,
        /// Whether the connection must be closed and reopened before reuse.
        invalidate: bool,
    },
    /// Wait, then record the outcome and reopen the connection.
    DelayThenComplete {
        /// How long to wait.
        delay: Duration,
        /// Outcome to record.
        outcome: Outcome,
    },
}

impl Disposition {
    fn complete(outcome: Outcome) -> Self {
        Disposition::Complete {
            outcome,
            invalidate: false,
        }
    }

    fn invalidating(outcome: Outcome) -> Self {
        Disposition::Complete {
            outcome,
            invalidate: true,
        }
    }

    /// Prefixes the error payload of the outcome with `tag`.
    fn tagged(self, tag: &str) -> Self {
        match self {
            Disposition::Retry => Disposition::Retry,
            Disposition::Complete {
                outcome,
                invalidate,
            } => Disposition::Complete {
                outcome: outcome.tagged(tag),
                invalidate,
            },
            Disposition::DelayThenComplete { delay, outcome } => Disposition::DelayThenComplete {
                delay,
                outcome: outcome.tagged(tag),
            },
        }
    }
}

/// Error payload `[kind, message]`, or `[kind]` without a message.
pub fn error_value(err: &DriverError) -> Value {
    match err.message() {
        Some(msg) => json!([err.kind(), msg]),
        None => json!([err.kind()]),
    }
}

/// Classifies a driver error. `not_ready_delay` is the pause applied before
/// failing on a connection that is not ready.
pub fn classify(err: &DriverError, not_ready_delay: Duration) -> Disposition {
    match err {
        DriverError::TryAgain(_) => Disposition::Retry,
        DriverError::Batch(inner) => classify(inner, not_ready_delay).tagged("batch"),
        DriverError::Rollback(_)
        | DriverError::ConflictingTransaction(_)
        | DriverError::CatalogVersionMismatch(_)
        | DriverError::OperationExpired(_)
        | DriverError::ConnectionRefused(_) => Disposition::complete(Outcome::Fail(error_value(err))),
        DriverError::ConnectionNotReady(_) => Disposition::DelayThenComplete {
            delay: not_ready_delay,
            outcome: Outcome::Fail(error_value(err)),
        },
        DriverError::ConnectionClosed(_) | DriverError::Timeout(_) => {
            Disposition::invalidating(Outcome::Info(error_value(err)))
        }
        DriverError::Other(_) => Disposition::complete(Outcome::Info(error_value(err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(500);

    fn outcome(d: Disposition) -> Outcome {
        match d {
            Disposition::Complete { outcome, .. } | Disposition::DelayThenComplete { outcome, .. } => {
                outcome
            }
            Disposition::Retry => panic!("unexpected retry"),
        }
    }

    #[test]
    fn test_try_again_is_retried() {
        assert_eq!(classify(&DriverError::TryAgain("x".into()), DELAY), Disposition::Retry);
        assert_eq!(
            classify(&DriverError::batch(DriverError::TryAgain("x".into())), DELAY),
            Disposition::Retry
        );
    }

    #[test]
    fn test_definite_failures() {
        for err in [
            DriverError::Rollback("serialization".into()),
            DriverError::ConflictingTransaction("t1".into()),
            DriverError::CatalogVersionMismatch("v3".into()),
            DriverError::OperationExpired("deadline".into()),
        ] {
            let out = outcome(classify(&err, DELAY));
            assert!(out.is_fail(), "{err} should fail");
            assert_eq!(out.error().unwrap()[0], json!(err.kind()));
        }
    }

    #[test]
    fn test_batch_is_unwrapped_and_tagged() {
        let err = DriverError::batch(DriverError::Rollback("conflict".into()));
        let out = outcome(classify(&err, DELAY));
        assert_eq!(out, Outcome::Fail(json!(["batch", "rollback", "conflict"])));

        let err = DriverError::batch(DriverError::Other("weird".into()));
        assert!(outcome(classify(&err, DELAY)).is_info());
    }

    #[test]
    fn test_not_ready_delays_then_fails() {
        let d = classify(&DriverError::ConnectionNotReady("warming".into()), DELAY);
        assert!(matches!(
            d,
            Disposition::DelayThenComplete { delay, ref outcome } if delay == DELAY && outcome.is_fail()
        ));
    }

    #[test]
    fn test_indeterminate_errors() {
        let d = classify(&DriverError::Timeout(Duration::from_secs(5)), DELAY);
        assert_eq!(
            d,
            Disposition::Complete {
                outcome: Outcome::Info(json!(["timeout"])),
                invalidate: true
            }
        );
        let d = classify(&DriverError::ConnectionClosed("reset".into()), DELAY);
        assert!(matches!(d, Disposition::Complete { invalidate: true, ref outcome } if outcome.is_info()));
        let d = classify(&DriverError::Other("???".into()), DELAY);
        assert!(matches!(d, Disposition::Complete { invalidate: false, ref outcome } if outcome.is_info()));
    }
}
