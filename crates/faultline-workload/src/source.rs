//! Seeded operation sources.
//!
//! The runner's generator asks a source for the next invocation of a
//! process. Sources are deterministic for a given seed so a run can be
//! replayed.

use faultline_core::{Operation, ProcessId};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde_json::{Value, json};

/// Produces invocations for a workload.
pub trait OpSource: Send {
    /// Returns the next invocation for `process`.
    fn next_op(&mut self, process: ProcessId) -> Operation;

    /// Reseeds the source.
    fn reset(&mut self, seed: u64);
}

/// Random reads and transfers between distinct accounts.
#[derive(Debug, Clone)]
pub struct BankOps {
    accounts: Vec<i64>,
    max_transfer: i64,
    read_ratio: f64,
    rng: ChaCha8Rng,
}

impl BankOps {
    /// Creates a source over `accounts` with transfers of 1 to
    /// `max_transfer` units and half of all operations being reads.
    pub fn new(accounts: Vec<i64>, max_transfer: i64, seed: u64) -> Self {
        Self {
            accounts,
            max_transfer: max_transfer.max(1),
            read_ratio: 0.5,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Sets the fraction of reads.
    pub fn with_read_ratio(mut self, ratio: f64) -> Self {
        self.read_ratio = ratio.clamp(0.0, 1.0);
        self
    }
}

impl OpSource for BankOps {
    fn next_op(&mut self, process: ProcessId) -> Operation {
        if self.accounts.len() < 2 || self.rng.gen_bool(self.read_ratio) {
            return Operation::invoke(process, "read", Value::Null);
        }
        let mut pair = self.accounts.choose_multiple(&mut self.rng, 2);
        let (Some(from), Some(to)) = (pair.next().copied(), pair.next().copied()) else {
            return Operation::invoke(process, "read", Value::Null);
        };
        let amount = self.rng.gen_range(1..=self.max_transfer);
        Operation::invoke(
            process,
            "transfer",
            json!({"from": from, "to": to, "amount": amount}),
        )
    }

    fn reset(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }
}

/// Random reads, writes and compare-and-sets on a few registers.
#[derive(Debug, Clone)]
pub struct RegisterOps {
    keys: Vec<i64>,
    values: i64,
    rng: ChaCha8Rng,
}

impl RegisterOps {
    /// Creates a source over `keys` with values drawn from `0..values`.
    pub fn new(keys: Vec<i64>, values: i64, seed: u64) -> Self {
        Self {
            keys,
            values: values.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl OpSource for RegisterOps {
    fn next_op(&mut self, process: ProcessId) -> Operation {
        let key = self.keys.choose(&mut self.rng).copied().unwrap_or_default();
        match self.rng.gen_range(0..3) {
            0 => Operation::invoke(process, "read", json!([key, null])),
            1 => {
                let v = self.rng.gen_range(0..self.values);
                Operation::invoke(process, "write", json!([key, v]))
            }
            _ => {
                let expected = self.rng.gen_range(0..self.values);
                let new = self.rng.gen_range(0..self.values);
                Operation::invoke(process, "cas", json!([key, [expected, new]]))
            }
        }
    }

    fn reset(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_ops_are_well_formed() {
        let mut source = BankOps::new((0..5).collect(), 5, 7);
        let mut transfers = 0;
        for _ in 0..200 {
            let op = source.next_op(ProcessId(1));
            match op.f.as_str() {
                "read" => assert!(op.value.is_null()),
                "transfer" => {
                    transfers += 1;
                    let from = op.value["from"].as_i64().unwrap();
                    let to = op.value["to"].as_i64().unwrap();
                    let amount = op.value["amount"].as_i64().unwrap();
                    assert_ne!(from, to);
                    assert!((1..=5).contains(&amount));
                }
                other => panic!("unexpected function {other}"),
            }
        }
        assert!(transfers > 0);
    }

    #[test]
    fn test_sources_are_deterministic() {
        let mut a = RegisterOps::new((0..5).collect(), 5, 42);
        let mut b = RegisterOps::new((0..5).collect(), 5, 42);
        for _ in 0..50 {
            assert_eq!(a.next_op(ProcessId(0)), b.next_op(ProcessId(0)));
        }

        let mut fresh = RegisterOps::new((0..5).collect(), 5, 42);
        a.reset(42);
        for _ in 0..10 {
            assert_eq!(a.next_op(ProcessId(2)), fresh.next_op(ProcessId(2)));
        }
    }

    #[test]
    fn test_single_account_only_reads() {
        let mut source = BankOps::new(vec![0], 5, 1);
        for _ in 0..10 {
            assert_eq!(source.next_op(ProcessId(0)).f, "read");
        }
    }
}
