//! Machine-checkable invariant descriptions.
//!
//! Every workload publishes an [`Invariant`] alongside its history. The
//! external checker does the real linearizability analysis; [`Invariant::check`]
//! is the cheap sanity pass the runner applies to every history before it
//! counts a run as passing.

use std::collections::{BTreeMap, BTreeSet};

use faultline_core::{History, OpType, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What must hold over a workload's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Invariant {
    /// Every `ok` read returns every account, and the balances sum to
    /// `total`. Without `allow_negatives` no balance is ever negative.
    TotalBalance {
        /// Account ids.
        accounts: Vec<i64>,
        /// Initial and permanent sum of all balances.
        total: i64,
        /// Whether balances may go below zero.
        allow_negatives: bool,
    },
    /// Every `ok` read of a register returns the initial value or a value
    /// some process tried to store, and a `cas` is `ok` only if its expected
    /// value matched.
    Registers {
        /// Register ids.
        keys: Vec<i64>,
        /// Initial value of every register.
        initial: i64,
    },
}

/// A history entry that breaks the invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Index of the offending entry.
    pub index: OperationId,
    /// What is wrong with it.
    pub reason: String,
}

/// Result of [`Invariant::check`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    /// Number of `ok` reads examined.
    pub reads: usize,
    /// Entries breaking the invariant.
    pub violations: Vec<Violation>,
}

impl InvariantReport {
    /// Returns true when nothing was violated.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    fn violation(&mut self, index: OperationId, reason: String) {
        self.violations.push(Violation { index, reason });
    }
}

impl Invariant {
    /// Returns the invariant as JSON for the checker.
    pub fn description(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Checks the `ok` reads of a history.
    pub fn check(&self, history: &History) -> InvariantReport {
        match self {
            Invariant::TotalBalance {
                accounts,
                total,
                allow_negatives,
            } => check_balances(history, accounts, *total, *allow_negatives),
            Invariant::Registers { keys, initial } => check_registers(history, keys, *initial),
        }
    }
}

fn client_ok_reads(history: &History) -> impl Iterator<Item = (OperationId, &Value)> {
    history
        .entries
        .iter()
        .filter(|e| e.op.op_type == OpType::Ok && e.op.f == "read" && !e.op.process.is_nemesis())
        .map(|e| (e.index, &e.op.value))
}

fn check_balances(
    history: &History,
    accounts: &[i64],
    total: i64,
    allow_negatives: bool,
) -> InvariantReport {
    let mut report = InvariantReport::default();
    let expected: BTreeSet<String> = accounts.iter().map(i64::to_string).collect();

    for (index, value) in client_ok_reads(history) {
        report.reads += 1;
        let Some(balances) = value.as_object() else {
            report.violation(index, format!("read returned {value}, not a map of balances"));
            continue;
        };

        let seen: BTreeSet<String> = balances.keys().cloned().collect();
        if seen != expected {
            report.violation(index, format!("read returned accounts {seen:?}, expected {expected:?}"));
        }

        let mut sum = 0_i64;
        for (account, balance) in balances {
            let Some(balance) = balance.as_i64() else {
                report.violation(index, format!("account {account} has balance {balance}"));
                continue;
            };
            if balance < 0 && !allow_negatives {
                report.violation(index, format!("account {account} has negative balance {balance}"));
            }
            sum += balance;
        }
        if sum != total {
            report.violation(index, format!("balances sum to {sum}, expected {total}"));
        }
    }
    report
}

fn check_registers(history: &History, keys: &[i64], initial: i64) -> InvariantReport {
    let mut report = InvariantReport::default();

    // Values any process attempted to store, per register.
    let mut candidates: BTreeMap<i64, BTreeSet<i64>> =
        keys.iter().map(|k| (*k, BTreeSet::from([initial]))).collect();
    for op in history.iter().filter(|op| op.op_type == OpType::Invoke) {
        let stored = match op.f.as_str() {
            "write" => op.value.get(1).and_then(Value::as_i64),
            "cas" => op.value.get(1).and_then(|v| v.get(1)).and_then(Value::as_i64),
            _ => None,
        };
        if let (Some(key), Some(v)) = (op.value.get(0).and_then(Value::as_i64), stored) {
            candidates.entry(key).or_default().insert(v);
        }
    }

    for (index, value) in client_ok_reads(history) {
        report.reads += 1;
        let key = value.get(0).and_then(Value::as_i64);
        let observed = value.get(1).and_then(Value::as_i64);
        match (key, observed) {
            (Some(key), Some(v)) => {
                if !candidates.get(&key).is_some_and(|c| c.contains(&v)) {
                    report.violation(index, format!("register {key} read {v}, which was never written"));
                }
            }
            _ => report.violation(index, format!("read returned {value}, not [id, value]")),
        }
    }
    report
}
