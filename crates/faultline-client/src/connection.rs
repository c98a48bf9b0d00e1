//! The driver seam.
//!
//! Workloads talk to the database only through [`Connection`], a small typed
//! interface over integer-keyed tables of integer values. A connection is
//! owned by exactly one process and never shared. [`Connector`] opens new
//! connections to a node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use faultline_core::NodeId;
use futures::future::BoxFuture;
use tracing::debug;

use crate::error::DriverResult;

/// One open database session.
#[async_trait]
pub trait Connection: Send {
    /// Returns the node this connection is bound to.
    fn node(&self) -> &NodeId;

    /// Creates a table if it does not exist.
    async fn create_table(&mut self, table: &str) -> DriverResult<()>;

    /// Drops a table if it exists.
    async fn drop_table(&mut self, table: &str) -> DriverResult<()>;

    /// Opens a serializable transaction.
    async fn begin(&mut self) -> DriverResult<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> DriverResult<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> DriverResult<()>;

    /// Reads one row.
    async fn read(&mut self, table: &str, key: i64) -> DriverResult<Option<i64>>;

    /// Reads every row of a table, ordered by key.
    async fn scan(&mut self, table: &str) -> DriverResult<BTreeMap<i64, i64>>;

    /// Inserts or replaces one row.
    async fn upsert(&mut self, table: &str, key: i64, value: i64) -> DriverResult<()>;

    /// Sets `key` to `new` only if it currently holds `expected`, as one
    /// atomic statement. Returns whether the row was updated.
    async fn compare_and_set(
        &mut self,
        table: &str,
        key: i64,
        expected: i64,
        new: i64,
    ) -> DriverResult<bool>;

    /// Closes the session.
    async fn close(&mut self) -> DriverResult<()>;
}

/// Opens connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `node`.
    async fn connect(&self, node: &NodeId) -> DriverResult<Box<dyn Connection>>;
}

/// Runs `body` inside a transaction.
///
/// Commits when `body` returns `Ok`, rolls back when it returns `Err` and
/// hands the error on. A rollback failure is logged and otherwise ignored;
/// the original error wins.
pub async fn with_txn<T, F>(conn: &mut dyn Connection, body: F) -> DriverResult<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut dyn Connection) -> BoxFuture<'c, DriverResult<T>> + Send,
{
    conn.begin().await?;
    match body(&mut *conn).await {
        Ok(value) => {
            conn.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback().await {
                debug!(node = %conn.node(), error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}
