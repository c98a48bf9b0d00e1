//! Single-key ACID registers.
//!
//! A handful of integer registers, each read and written with single
//! statements. `cas` is one conditional update, so it either matches and
//! applies atomically or reports `fail`. The history is checked for
//! linearizability per register.

use async_trait::async_trait;
use faultline_client::{Connection, DriverResult, OperationHandler};
use faultline_core::{Operation, Outcome};
use serde_json::{Value, json};

use crate::invariant::Invariant;
use crate::source::{OpSource, RegisterOps};
use crate::workload::Workload;

/// Table holding the registers.
pub const REGISTERS_TABLE: &str = "registers";

/// The single-key ACID workload.
#[derive(Debug, Clone)]
pub struct RegisterWorkload {
    keys: i64,
    initial: i64,
}

impl Default for RegisterWorkload {
    fn default() -> Self {
        Self { keys: 5, initial: 0 }
    }
}

/// Creates the single-key ACID workload: five registers initialised to 0.
pub fn single_key_acid() -> RegisterWorkload {
    RegisterWorkload::default()
}

impl RegisterWorkload {
    /// Returns the register ids.
    pub fn keys(&self) -> Vec<i64> {
        (0..self.keys).collect()
    }
}

fn invalid(op: &Operation) -> Outcome {
    Outcome::Fail(json!(["invalid-op", op.f, op.value]))
}

#[async_trait]
impl OperationHandler for RegisterWorkload {
    async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        conn.create_table(REGISTERS_TABLE).await?;
        for key in self.keys() {
            conn.upsert(REGISTERS_TABLE, key, self.initial).await?;
        }
        Ok(())
    }

    async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
        let Some(key) = op.value.get(0).and_then(Value::as_i64) else {
            return Ok(invalid(op));
        };

        match op.f.as_str() {
            "read" => {
                let value = conn.read(REGISTERS_TABLE, key).await?;
                Ok(Outcome::Ok(json!([key, value])))
            }
            "write" => {
                let Some(value) = op.value.get(1).and_then(Value::as_i64) else {
                    return Ok(invalid(op));
                };
                conn.upsert(REGISTERS_TABLE, key, value).await?;
                Ok(Outcome::Ok(op.value.clone()))
            }
            "cas" => {
                let pair = op.value.get(1);
                let expected = pair.and_then(|p| p.get(0)).and_then(Value::as_i64);
                let new = pair.and_then(|p| p.get(1)).and_then(Value::as_i64);
                let (Some(expected), Some(new)) = (expected, new) else {
                    return Ok(invalid(op));
                };
                if conn.compare_and_set(REGISTERS_TABLE, key, expected, new).await? {
                    Ok(Outcome::Ok(op.value.clone()))
                } else {
                    Ok(Outcome::Fail(json!(["cas-mismatch", key, expected])))
                }
            }
            other => Ok(Outcome::Fail(json!(["unknown-function", other]))),
        }
    }

    async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        conn.drop_table(REGISTERS_TABLE).await
    }
}

impl Workload for RegisterWorkload {
    fn name(&self) -> &'static str {
        "single-key-acid"
    }

    fn invariant(&self) -> Invariant {
        Invariant::Registers {
            keys: self.keys(),
            initial: self.initial,
        }
    }

    fn op_source(&self, seed: u64) -> Box<dyn OpSource> {
        Box::new(RegisterOps::new(self.keys(), 5, seed))
    }
}
