//! History recording and storage.
//!
//! Every client process and the nemesis append to one shared
//! [`HistoryRecorder`]. The recorder assigns a global index and a monotonic
//! timestamp to each entry, so the final [`History`] is a total order of
//! everything observed during a run. Histories are persisted as JSON lines by
//! [`JsonLinesStore`] for the external checker.

use crate::error::HistoryError;
use crate::node::NodeId;
use crate::operation::{OpType, Operation, OperationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique identifier for a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new unique RunId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata describing the run that produced a history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMetadata {
    /// Workload name (`bank`, `multi-bank`, `single-key-acid`).
    pub workload: String,

    /// Nemesis name from the registry.
    pub nemesis: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run ended.
    pub ended_at: Option<DateTime<Utc>>,

    /// Nodes of the cluster under test.
    pub nodes: Vec<NodeId>,

    /// Number of concurrent client processes.
    pub concurrency: usize,

    /// Seed used for fault and operation randomness.
    pub seed: Option<u64>,
}

impl HistoryMetadata {
    /// Creates metadata for a run starting now.
    pub fn new(workload: impl Into<String>, nemesis: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            nemesis: nemesis.into(),
            started_at: Utc::now(),
            ended_at: None,
            nodes: Vec::new(),
            concurrency: 0,
            seed: None,
        }
    }

    /// Sets the cluster nodes.
    pub fn with_nodes(mut self, nodes: Vec<NodeId>) -> Self {
        self.nodes = nodes;
        self
    }

    /// Sets the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Returns the run duration in milliseconds, if ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

/// One indexed, timestamped history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Position in the history.
    pub index: OperationId,

    /// Nanoseconds since the recorder was created.
    pub time: u64,

    /// The recorded operation.
    #[serde(flatten)]
    pub op: Operation,
}

/// A complete, ordered history of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    /// The unique identifier for this run.
    pub run_id: RunId,

    /// Metadata about the run.
    pub metadata: HistoryMetadata,

    /// Entries in recording order.
    pub entries: Vec<HistoryEntry>,
}

impl History {
    /// Returns the number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the history contains no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over the operations in order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.entries.iter().map(|e| &e.op)
    }

    /// Returns client completions of the given type and function.
    pub fn completions<'a>(
        &'a self,
        op_type: OpType,
        f: &'a str,
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        self.iter()
            .filter(move |op| op.op_type == op_type && op.f == f && !op.process.is_nemesis())
    }

    /// Returns the nemesis events.
    pub fn nemesis_events(&self) -> impl Iterator<Item = &Operation> {
        self.iter().filter(|op| op.process.is_nemesis())
    }

    /// Counts client completions by type: `(ok, fail, info)`.
    pub fn outcome_counts(&self) -> (usize, usize, usize) {
        self.iter()
            .filter(|op| !op.process.is_nemesis())
            .fold((0, 0, 0), |(ok, fail, info), op| match op.op_type {
                OpType::Ok => (ok + 1, fail, info),
                OpType::Fail => (ok, fail + 1, info),
                OpType::Info => (ok, fail, info + 1),
                OpType::Invoke => (ok, fail, info),
            })
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    entries: Vec<HistoryEntry>,
    sealed: bool,
}

/// Shared, append-only recorder for a single run.
///
/// Cloning is cheap; all clones append to the same history.
#[derive(Debug, Clone)]
pub struct HistoryRecorder {
    run_id: RunId,
    origin: Instant,
    state: Arc<Mutex<RecorderState>>,
}

impl HistoryRecorder {
    /// Creates an empty recorder for a new run.
    pub fn new() -> Self {
        Self {
            run_id: RunId::new(),
            origin: Instant::now(),
            state: Arc::new(Mutex::new(RecorderState::default())),
        }
    }

    /// Returns the run id.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Appends an operation, returning its index.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Sealed`] once [`seal`](Self::seal) was called.
    pub fn record(&self, op: Operation) -> Result<OperationId, HistoryError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.sealed {
            return Err(HistoryError::Sealed);
        }
        // Timestamp under the lock so time order matches index order.
        let time = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let index = OperationId(state.entries.len() as u64);
        debug!(index = index.0, op = %op, "Recorded");
        state.entries.push(HistoryEntry { index, time, op });
        Ok(index)
    }

    /// Returns the number of entries recorded so far.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of the entries recorded so far.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    /// Stops recording and returns the finished history.
    ///
    /// Later calls to [`record`](Self::record) fail; later calls to `seal`
    /// return the same entries.
    pub fn seal(&self, mut metadata: HistoryMetadata) -> History {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sealed = true;
        if metadata.ended_at.is_none() {
            metadata.ended_at = Some(Utc::now());
        }
        History {
            run_id: self.run_id,
            metadata,
            entries: state.entries.clone(),
        }
    }
}

impl Default for HistoryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// File-backed store writing one directory per run.
///
/// Layout: `<root>/<workload>_nemesis_<nemesis>_<timestamp>/` containing
/// `history.jsonl`, `metadata.json` and `invariant.json`.
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    root: PathBuf,
}

impl JsonLinesStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name used for a run.
    pub fn run_dir_name(metadata: &HistoryMetadata) -> String {
        format!(
            "{}_nemesis_{}_{}",
            metadata.workload,
            metadata.nemesis,
            metadata.started_at.format("%Y-%m-%dT%H-%M-%S")
        )
    }

    /// Writes a history and the workload's invariant description.
    ///
    /// Returns the run directory.
    pub async fn save(
        &self,
        history: &History,
        invariant: &serde_json::Value,
    ) -> Result<PathBuf, HistoryError> {
        let dir = self.root.join(Self::run_dir_name(&history.metadata));
        tokio::fs::create_dir_all(&dir).await?;

        let mut file = tokio::fs::File::create(dir.join("history.jsonl")).await?;
        let mut buf = Vec::with_capacity(history.len() * 96);
        for entry in &history.entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        file.write_all(&buf).await?;
        file.flush().await?;

        let metadata = serde_json::to_vec_pretty(&history.metadata)?;
        tokio::fs::write(dir.join("metadata.json"), metadata).await?;
        let invariant = serde_json::to_vec_pretty(invariant)?;
        tokio::fs::write(dir.join("invariant.json"), invariant).await?;

        info!(
            run_id = %history.run_id,
            entries = history.len(),
            dir = %dir.display(),
            "History saved"
        );
        Ok(dir)
    }

    /// Loads the entries of a saved run directory.
    pub async fn load(dir: &Path) -> Result<Vec<HistoryEntry>, HistoryError> {
        let file = tokio::fs::File::open(dir.join("history.jsonl")).await?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        let mut line_no = 0;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line)
                .map_err(|e| HistoryError::corrupted(line_no, e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ProcessId;
    use crate::operation::Outcome;
    use serde_json::json;

    #[test]
    fn test_recorder_orders_entries() {
        let recorder = HistoryRecorder::new();
        let op = Operation::invoke(ProcessId(0), "read", serde_json::Value::Null);
        let a = recorder.record(op.clone()).unwrap();
        let b = recorder
            .record(op.complete(Outcome::Ok(json!({"0": 100}))))
            .unwrap();
        assert_eq!(a, OperationId(0));
        assert_eq!(b, OperationId(1));

        let entries = recorder.snapshot();
        assert!(entries[0].time <= entries[1].time);
    }

    #[test]
    fn test_seal_rejects_further_records() {
        let recorder = HistoryRecorder::new();
        recorder
            .record(Operation::nemesis(OpType::Info, "start", json!(null)))
            .unwrap();
        let history = recorder.seal(HistoryMetadata::new("bank", "none"));
        assert_eq!(history.len(), 1);
        assert!(history.metadata.ended_at.is_some());

        let err = recorder
            .record(Operation::nemesis(OpType::Info, "stop", json!(null)))
            .unwrap_err();
        assert!(matches!(err, HistoryError::Sealed));
    }

    #[test]
    fn test_outcome_counts() {
        let recorder = HistoryRecorder::new();
        let op = Operation::invoke(ProcessId(1), "cas", json!([0, [0, 1]]));
        recorder.record(op.clone()).unwrap();
        recorder.record(op.complete(Outcome::Ok(json!([0, 1])))).unwrap();
        recorder.record(op.clone()).unwrap();
        recorder.record(op.complete(Outcome::Fail(json!(["cas-mismatch"])))).unwrap();
        recorder.record(op.clone()).unwrap();
        recorder.record(op.complete(Outcome::Info(json!(["timeout"])))).unwrap();
        recorder
            .record(Operation::nemesis(OpType::Info, "start", json!(null)))
            .unwrap();

        let history = recorder.seal(HistoryMetadata::new("single-key-acid", "none"));
        assert_eq!(history.outcome_counts(), (1, 1, 1));
        assert_eq!(history.completions(OpType::Ok, "cas").count(), 1);
        assert_eq!(history.nemesis_events().count(), 1);
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonLinesStore::new(dir.path());

        let recorder = HistoryRecorder::new();
        let op = Operation::invoke(ProcessId(2), "write", json!([3, 7]));
        recorder.record(op.clone()).unwrap();
        recorder.record(op.complete(Outcome::Ok(json!([3, 7])))).unwrap();
        let history = recorder.seal(HistoryMetadata::new("single-key-acid", "none"));

        let run_dir = store.save(&history, &json!({"model": "cas-register"})).await.unwrap();
        assert!(run_dir.join("invariant.json").exists());

        let loaded = JsonLinesStore::load(&run_dir).await.unwrap();
        assert_eq!(loaded, history.entries);
    }

    #[tokio::test]
    async fn test_load_reports_corrupted_line() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("history.jsonl"), "{\"index\":0}\n")
            .await
            .unwrap();
        let err = JsonLinesStore::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupted { line: 1, .. }));
    }
}
