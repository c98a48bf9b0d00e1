//! # Faultline Nemesis - fault catalog and scheduling
//!
//! The nemesis injects faults into the cluster under test while workload
//! clients run, independently of them and without any barrier.
//!
//! ## Overview
//!
//! - **Faults** ([`faults`]): process kills and pauses, network partitions
//!   and clock skew, each with an idempotent `start`/`stop` lifecycle
//! - **Controllers** ([`controller`]): the interfaces faults act through,
//!   implemented over ssh ([`distribution`]) or in memory ([`dry_run`])
//! - **Schedules** ([`schedule`]): pull-based event sequences with a terminal
//!   cleanup sequence
//! - **Runner** ([`runner`]): the cancellable task that applies a schedule
//!   and records every event in the history
//! - **Registry** ([`registry`]): nemesis packages by name
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use faultline_core::{HistoryRecorder, NodeId};
//! use faultline_nemesis::{DryRunController, FaultContext, NemesisRegistry, NemesisRunner};
//!
//! # async fn demo() {
//! let nodes: Vec<NodeId> = vec!["n1".into(), "n2".into(), "n3".into()];
//! let controller = Arc::new(DryRunController::new(&nodes));
//! let ctx = Arc::new(FaultContext::new(nodes, controller.clone(), controller));
//!
//! let package = NemesisRegistry::default().build("partition-random-halves").unwrap();
//! let (stop, shutdown) = tokio::sync::watch::channel(false);
//! let nemesis = NemesisRunner::new(package, ctx, HistoryRecorder::new()).spawn(shutdown);
//!
//! // ... run the workload ...
//!
//! stop.send(true).unwrap();
//! let summary = nemesis.await.unwrap();
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod context;
pub mod controller;
pub mod distribution;
pub mod dry_run;
pub mod error;
pub mod faults;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod traits;

pub use context::{AwaitPolicy, FaultContext};
pub use controller::{ClusterController, Grudge, PartitionProvider, Role, Signal};
pub use distribution::{
    CommandOutput, CommandRunner, Distribution, DryRunRunner, Edition, Os, ShellController,
    SshRunner,
};
pub use dry_run::{ControllerCall, DryRunController, ProcessState};
pub use error::{NemesisError, Result};
pub use registry::{NEMESIS_NAMES, NemesisPackage, NemesisRegistry};
pub use runner::{NemesisRunner, NemesisSummary};
pub use schedule::{ClockSchedule, FaultEvent, Schedule, ScheduleConfig, StartStopSchedule};
pub use traits::{Fault, FaultStatus, SharedFault};
