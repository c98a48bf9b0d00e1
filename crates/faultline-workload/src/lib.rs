//! Faultline Workload - the workloads run against the cluster.
//!
//! - [`bank`]: `bank` and `multi_bank`, money transfers that preserve a total
//! - [`register`]: `single_key_acid`, reads, writes and compare-and-set on
//!   a few registers
//! - [`invariant`]: what the checker verifies, plus a cheap sanity check
//! - [`source`]: seeded generators of invocations
//! - [`workload`]: the [`Workload`] trait and lookup by name
//!
//! # Example
//!
//! ```
//! use faultline_workload::{BankConfig, Invariant, lookup};
//!
//! let workload = lookup("bank", &BankConfig::default()).unwrap();
//! assert_eq!(workload.name(), "bank");
//! assert!(matches!(workload.invariant(), Invariant::TotalBalance { total: 100, .. }));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bank;
pub mod error;
pub mod invariant;
pub mod register;
pub mod source;
pub mod workload;

pub use bank::{BankConfig, BankLayout, BankWorkload, Transfer, bank, multi_bank};
pub use error::{Result, WorkloadError};
pub use invariant::{Invariant, InvariantReport, Violation};
pub use register::{RegisterWorkload, single_key_acid};
pub use source::{BankOps, OpSource, RegisterOps};
pub use workload::{SharedWorkload, WORKLOAD_NAMES, Workload, lookup};
