//! In-memory cluster for tests and dry runs.
//!
//! [`MemoryCluster`] stands in for the database: a set of integer tables
//! behind one lock. A transaction holds the lock from `begin` until `commit`
//! or `rollback`, which makes every execution serializable. Nodes can be
//! taken down, and failures can be scripted per call site, so the runtime's
//! error handling can be exercised without a real driver.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use faultline_core::NodeId;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::connection::{Connection, Connector};
use crate::error::{DriverError, DriverResult};

type Tables = BTreeMap<String, BTreeMap<i64, i64>>;

/// Where a scripted failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectPoint {
    /// Opening a connection.
    Connect,
    /// `begin`.
    Begin,
    /// `read` and `scan`.
    Read,
    /// DDL, `upsert` and `compare_and_set`.
    Write,
    /// `commit`, before the writes are applied.
    Commit,
    /// `commit`, after the writes are applied.
    AfterCommit,
}

/// What a scripted failure does.
#[derive(Debug, Clone)]
pub enum Injection {
    /// Return this error.
    Fail(DriverError),
    /// Never complete.
    Hang,
}

#[derive(Debug)]
struct Scripted {
    node: Option<NodeId>,
    point: InjectPoint,
    injection: Injection,
}

#[derive(Debug, Default)]
struct Control {
    nodes: BTreeSet<NodeId>,
    down: BTreeSet<NodeId>,
    script: Vec<Scripted>,
}

#[derive(Debug, Default)]
struct Inner {
    data: Arc<Mutex<Tables>>,
    control: StdMutex<Control>,
    commits: AtomicU64,
    connections: AtomicU64,
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_down(&self, node: &NodeId) -> bool {
        self.control().down.contains(node)
    }

    fn take_injection(&self, node: &NodeId, point: InjectPoint) -> Option<Injection> {
        let mut control = self.control();
        let index = control
            .script
            .iter()
            .position(|s| s.point == point && s.node.as_ref().is_none_or(|n| n == node))?;
        Some(control.script.remove(index).injection)
    }
}

async fn fire(injection: Injection) -> DriverResult<()> {
    match injection {
        Injection::Fail(err) => Err(err),
        Injection::Hang => futures::future::pending().await,
    }
}

/// A shared, serializable in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl MemoryCluster {
    /// Creates a cluster with the given nodes, all up.
    pub fn new(nodes: &[NodeId]) -> Self {
        let cluster = Self::default();
        cluster.inner.control().nodes = nodes.iter().cloned().collect();
        cluster
    }

    /// Marks a node up or down. Down nodes refuse new connections and break
    /// open ones on their next call.
    pub fn set_available(&self, node: &NodeId, available: bool) {
        debug!(node = %node, available, "Memory cluster node availability changed");
        let mut control = self.inner.control();
        if available {
            control.down.remove(node);
        } else {
            control.down.insert(node.clone());
        }
    }

    /// Returns whether a node is up.
    pub fn is_available(&self, node: &NodeId) -> bool {
        !self.inner.is_down(node)
    }

    /// Makes the next call at `point`, on any node, fail with `err`.
    pub fn inject(&self, point: InjectPoint, err: DriverError) {
        self.script(None, point, Injection::Fail(err));
    }

    /// Makes the next call at `point` on `node` fail with `err`.
    pub fn inject_on(&self, node: &NodeId, point: InjectPoint, err: DriverError) {
        self.script(Some(node.clone()), point, Injection::Fail(err));
    }

    /// Makes the next call at `point`, on any node, hang forever.
    pub fn hang_next(&self, point: InjectPoint) {
        self.script(None, point, Injection::Hang);
    }

    fn script(&self, node: Option<NodeId>, point: InjectPoint, injection: Injection) {
        self.inner.control().script.push(Scripted {
            node,
            point,
            injection,
        });
    }

    /// Returns a copy of a table, or `None` if it does not exist.
    pub async fn table(&self, name: &str) -> Option<BTreeMap<i64, i64>> {
        self.inner.data.lock().await.get(name).cloned()
    }

    /// Returns the names of all tables.
    pub async fn table_names(&self) -> Vec<String> {
        self.inner.data.lock().await.keys().cloned().collect()
    }

    /// Number of committed transactions.
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    /// Number of connections opened.
    pub fn connections(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, node: &NodeId) -> DriverResult<Box<dyn Connection>> {
        if let Some(injection) = self.inner.take_injection(node, InjectPoint::Connect) {
            fire(injection).await?;
        }
        if !self.inner.control().nodes.contains(node) {
            return Err(DriverError::ConnectionRefused(format!("unknown node {node}")));
        }
        if self.inner.is_down(node) {
            return Err(DriverError::ConnectionRefused(format!("{node} is down")));
        }
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
        trace!(node = %node, "Opened memory connection");
        Ok(Box::new(MemoryConnection {
            node: node.clone(),
            inner: self.inner.clone(),
            txn: None,
            closed: false,
        }))
    }
}

struct Txn {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

/// A session on a [`MemoryCluster`].
pub struct MemoryConnection {
    node: NodeId,
    inner: Arc<Inner>,
    txn: Option<Txn>,
    closed: bool,
}

impl MemoryConnection {
    async fn check(&self, point: InjectPoint) -> DriverResult<()> {
        if self.closed {
            return Err(DriverError::ConnectionClosed("connection is closed".into()));
        }
        if self.inner.is_down(&self.node) {
            return Err(DriverError::ConnectionClosed(format!("{} is down", self.node)));
        }
        if let Some(injection) = self.inner.take_injection(&self.node, point) {
            fire(injection).await?;
        }
        Ok(())
    }

    /// Runs `f` on the transaction's working copy, or on the shared tables
    /// as a single-statement transaction.
    async fn with_tables<T, F>(&mut self, f: F) -> DriverResult<T>
    where
        F: FnOnce(&mut Tables) -> DriverResult<T> + Send,
    {
        match &mut self.txn {
            Some(txn) => f(&mut txn.working),
            None => {
                let mut tables = self.inner.data.lock().await;
                f(&mut tables)
            }
        }
    }
}

fn missing(table: &str) -> DriverError {
    DriverError::Other(format!("relation \"{table}\" does not exist"))
}

#[async_trait]
impl Connection for MemoryConnection {
    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn create_table(&mut self, table: &str) -> DriverResult<()> {
        self.check(InjectPoint::Write).await?;
        self.with_tables(|t| {
            t.entry(table.to_string()).or_default();
            Ok(())
        })
        .await
    }

    async fn drop_table(&mut self, table: &str) -> DriverResult<()> {
        self.check(InjectPoint::Write).await?;
        self.with_tables(|t| {
            t.remove(table);
            Ok(())
        })
        .await
    }

    async fn begin(&mut self) -> DriverResult<()> {
        self.check(InjectPoint::Begin).await?;
        if self.txn.is_some() {
            return Err(DriverError::Other("transaction already in progress".into()));
        }
        let guard = self.inner.data.clone().lock_owned().await;
        let working = guard.clone();
        self.txn = Some(Txn { guard, working });
        Ok(())
    }

    async fn commit(&mut self) -> DriverResult<()> {
        if let Err(e) = self.check(InjectPoint::Commit).await {
            self.txn = None;
            return Err(e);
        }
        let Some(Txn { mut guard, working }) = self.txn.take() else {
            return Err(DriverError::Other("no transaction in progress".into()));
        };
        *guard = working;
        drop(guard);
        self.inner.commits.fetch_add(1, Ordering::Relaxed);

        if let Some(injection) = self.inner.take_injection(&self.node, InjectPoint::AfterCommit) {
            fire(injection).await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.txn = None;
        Ok(())
    }

    async fn read(&mut self, table: &str, key: i64) -> DriverResult<Option<i64>> {
        self.check(InjectPoint::Read).await?;
        self.with_tables(|t| Ok(t.get(table).ok_or_else(|| missing(table))?.get(&key).copied()))
            .await
    }

    async fn scan(&mut self, table: &str) -> DriverResult<BTreeMap<i64, i64>> {
        self.check(InjectPoint::Read).await?;
        self.with_tables(|t| t.get(table).cloned().ok_or_else(|| missing(table)))
            .await
    }

    async fn upsert(&mut self, table: &str, key: i64, value: i64) -> DriverResult<()> {
        self.check(InjectPoint::Write).await?;
        self.with_tables(|t| {
            t.get_mut(table).ok_or_else(|| missing(table))?.insert(key, value);
            Ok(())
        })
        .await
    }

    async fn compare_and_set(
        &mut self,
        table: &str,
        key: i64,
        expected: i64,
        new: i64,
    ) -> DriverResult<bool> {
        self.check(InjectPoint::Write).await?;
        self.with_tables(|t| {
            let rows = t.get_mut(table).ok_or_else(|| missing(table))?;
            match rows.get_mut(&key) {
                Some(v) if *v == expected => {
                    *v = new;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.txn = None;
        self.closed = true;
        Ok(())
    }
}
