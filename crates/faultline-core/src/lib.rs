//! Faultline Core - shared types for the fault-injection harness.
//!
//! This crate provides the types every other faultline crate speaks:
//!
//! - [`node`]: node, process and actor identifiers
//! - [`operation`]: invocations, completions and their `ok`/`fail`/`info`
//!   outcomes
//! - [`history`]: the shared append-only recorder and the JSON-lines store
//!   consumed by the external checker
//! - [`error`]: error types for history handling
//!
//! # Example
//!
//! ```
//! use faultline_core::history::{HistoryMetadata, HistoryRecorder};
//! use faultline_core::node::ProcessId;
//! use faultline_core::operation::{Operation, Outcome};
//! use serde_json::json;
//!
//! let recorder = HistoryRecorder::new();
//! let op = Operation::invoke(ProcessId(0), "write", json!([1, 3]));
//! recorder.record(op.clone()).unwrap();
//! recorder.record(op.complete(Outcome::Ok(json!([1, 3])))).unwrap();
//!
//! let history = recorder.seal(HistoryMetadata::new("single-key-acid", "none"));
//! assert_eq!(history.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod error;
pub mod history;
pub mod node;
pub mod operation;

pub use error::HistoryError;
pub use history::{History, HistoryEntry, HistoryMetadata, HistoryRecorder, JsonLinesStore, RunId};
pub use node::{Actor, NodeId, ProcessId};
pub use operation::{OpType, Operation, OperationId, Outcome};
