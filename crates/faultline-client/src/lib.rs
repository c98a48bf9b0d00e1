//! Faultline Client - the per-process client runtime.
//!
//! This crate sits between workloads and the database driver:
//!
//! - [`connection`]: the typed [`Connection`] seam and transaction helper
//! - [`error`] and [`classify`]: driver error kinds and how each becomes an
//!   `ok`, `fail` or `info` outcome
//! - [`retry`]: backoff for transient "try again" errors
//! - [`handler`]: the [`OperationHandler`] trait workloads implement, and
//!   the [`Guarded`] decorator running setup and teardown once per run
//! - [`runtime`]: the [`ClientRuntime`] state machine
//! - [`memory`]: an in-memory serializable cluster for tests and dry runs

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod classify;
pub mod connection;
pub mod error;
pub mod handler;
pub mod memory;
pub mod once;
pub mod retry;
pub mod runtime;

pub use classify::{Disposition, classify, error_value};
pub use connection::{Connection, Connector, with_txn};
pub use error::{ClientError, DriverError, DriverResult, Result};
pub use handler::{Guarded, OperationHandler, guarded};
pub use memory::{InjectPoint, Injection, MemoryCluster, MemoryConnection};
pub use once::{OnceFlag, SetupGuard};
pub use retry::RetryPolicy;
pub use runtime::{ClientConfig, ClientRuntime, ClientState};
