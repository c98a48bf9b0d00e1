//! Operation types for the harness.
//!
//! An [`Operation`] is an invocation or a completion. The generator submits an
//! invocation (`type: invoke`); the client runtime answers with exactly one
//! completion of type `ok`, `fail` or `info`. Both halves are appended to the
//! history and are never modified afterwards.

use crate::node::{Actor, ProcessId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Unique index of an entry within a run's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl OperationId {
    /// Creates a new OperationId with the given value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the inner value.
    #[inline]
    pub const fn inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

/// The type of a history entry.
///
/// - `Ok`: the operation took effect.
/// - `Fail`: the operation provably did not take effect.
/// - `Info`: the outcome is unknown; a checker must consider both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    /// The operation has been submitted but not yet completed.
    Invoke,
    /// Applied and durable.
    Ok,
    /// Did not take effect.
    Fail,
    /// Indeterminate.
    Info,
}

impl OpType {
    /// Returns true for `ok`, `fail` and `info`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OpType::Invoke)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpType::Invoke => "invoke",
            OpType::Ok => "ok",
            OpType::Fail => "fail",
            OpType::Info => "info",
        };
        f.write_str(s)
    }
}

/// Terminal result of executing an operation.
///
/// `Fail` and `Info` carry a machine-readable error, usually a JSON array
/// whose first element names the error kind (e.g. `["negative", 1, -10]`).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Applied; the value is the observed result.
    Ok(Value),
    /// Provably not applied.
    Fail(Value),
    /// May or may not have been applied.
    Info(Value),
}

impl Outcome {
    /// Returns the op type this outcome is recorded as.
    pub fn op_type(&self) -> OpType {
        match self {
            Outcome::Ok(_) => OpType::Ok,
            Outcome::Fail(_) => OpType::Fail,
            Outcome::Info(_) => OpType::Info,
        }
    }

    /// Returns true for `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// Returns true for `Fail`.
    pub fn is_fail(&self) -> bool {
        matches!(self, Outcome::Fail(_))
    }

    /// Returns true for `Info`.
    pub fn is_info(&self) -> bool {
        matches!(self, Outcome::Info(_))
    }

    /// Returns the error payload of a `Fail` or `Info` outcome.
    pub fn error(&self) -> Option<&Value> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Fail(e) | Outcome::Info(e) => Some(e),
        }
    }

    /// Prefixes the error payload with a tag, keeping the original error as
    /// the remaining elements: `["batch", "negative", 1, -10]`.
    pub fn tagged(self, tag: &str) -> Self {
        fn tag_value(tag: &str, err: Value) -> Value {
            let mut tagged = vec![Value::from(tag)];
            match err {
                Value::Array(items) => tagged.extend(items),
                other => tagged.push(other),
            }
            Value::Array(tagged)
        }

        match self {
            Outcome::Ok(v) => Outcome::Ok(v),
            Outcome::Fail(e) => Outcome::Fail(tag_value(tag, e)),
            Outcome::Info(e) => Outcome::Info(tag_value(tag, e)),
        }
    }
}

/// An invocation or completion recorded in the history.
///
/// # Examples
///
/// ```
/// use faultline_core::node::ProcessId;
/// use faultline_core::operation::{Operation, OpType, Outcome};
/// use serde_json::json;
///
/// let invoke = Operation::invoke(ProcessId(0), "transfer", json!({"from": 0, "to": 1, "amount": 5}));
/// assert_eq!(invoke.op_type, OpType::Invoke);
///
/// let done = invoke.complete(Outcome::Fail(json!(["negative", 0, -5])));
/// assert_eq!(done.op_type, OpType::Fail);
/// assert_eq!(done.value, invoke.value);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// The process that issued this operation.
    pub process: Actor,

    /// Invocation or completion type.
    #[serde(rename = "type")]
    pub op_type: OpType,

    /// The function being called (`read`, `transfer`, `cas`, `start`, ...).
    pub f: String,

    /// Input for invocations, observed result for `ok` completions.
    pub value: Value,

    /// Error payload for `fail` and `info` completions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Operation {
    /// Creates a client invocation.
    pub fn invoke(process: ProcessId, f: impl Into<String>, value: Value) -> Self {
        Self {
            process: Actor::Client(process),
            op_type: OpType::Invoke,
            f: f.into(),
            value,
            error: None,
        }
    }

    /// Creates a nemesis event of the given type.
    pub fn nemesis(op_type: OpType, f: impl Into<String>, value: Value) -> Self {
        Self {
            process: Actor::NEMESIS,
            op_type,
            f: f.into(),
            value,
            error: None,
        }
    }

    /// Builds the completion of this invocation.
    ///
    /// `ok` completions carry the outcome's value; `fail` and `info`
    /// completions keep the invocation's input and attach the error.
    pub fn complete(&self, outcome: Outcome) -> Self {
        let op_type = outcome.op_type();
        let (value, error) = match outcome {
            Outcome::Ok(v) => (v, None),
            Outcome::Fail(e) | Outcome::Info(e) => (self.value.clone(), Some(e)),
        };
        Self {
            process: self.process,
            op_type,
            f: self.f.clone(),
            value,
            error,
        }
    }

    /// Returns the client process, if any.
    pub fn client(&self) -> Option<ProcessId> {
        self.process.process()
    }

    /// Returns true if this is a completion.
    pub fn is_complete(&self) -> bool {
        self.op_type.is_terminal()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :{} :{} {}", self.process, self.op_type, self.f, self.value)?;
        if let Some(err) = &self.error {
            write!(f, " {}", err)?;
        }
        Ok(())
    }
}
