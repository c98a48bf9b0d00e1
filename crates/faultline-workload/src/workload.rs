//! The workload trait and lookup by name.

use std::sync::Arc;

use faultline_client::OperationHandler;

use crate::bank::{BankConfig, BankLayout, BankWorkload};
use crate::error::{Result, WorkloadError};
use crate::invariant::Invariant;
use crate::register::single_key_acid;
use crate::source::OpSource;

/// A workload: an operation handler that also knows its name, its invariant
/// and how to generate its operations.
pub trait Workload: OperationHandler {
    /// Name used in run directories and the CLI.
    fn name(&self) -> &'static str;

    /// What the checker must verify.
    fn invariant(&self) -> Invariant;

    /// Creates a seeded source of invocations.
    fn op_source(&self, seed: u64) -> Box<dyn OpSource>;
}

/// A shareable workload.
pub type SharedWorkload = Arc<dyn Workload>;

/// Canonical names of the available workloads.
pub const WORKLOAD_NAMES: &[&str] = &["bank", "bank-multitable", "single-key-acid"];

/// Resolves a workload by name. `multi-bank` is accepted for
/// `bank-multitable`. `bank` settings apply to both bank workloads.
pub fn lookup(name: &str, bank: &BankConfig) -> Result<SharedWorkload> {
    let workload: SharedWorkload = match name {
        "bank" => Arc::new(BankWorkload::new(bank.clone(), BankLayout::SingleTable)?),
        "bank-multitable" | "multi-bank" => {
            Arc::new(BankWorkload::new(bank.clone(), BankLayout::TablePerAccount)?)
        }
        "single-key-acid" => Arc::new(single_key_acid()),
        other => return Err(WorkloadError::UnknownWorkload(other.to_string())),
    };
    Ok(workload)
}
