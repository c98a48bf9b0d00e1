//! Operation handlers and their decorators.
//!
//! An [`OperationHandler`] is what a workload implements: schema setup,
//! executing one operation over a connection, and teardown. Decorators wrap
//! a handler and return a handler, so behaviour is layered by composition.

use std::sync::Arc;

use async_trait::async_trait;
use faultline_core::{Operation, Outcome};
use tracing::debug;

use crate::connection::Connection;
use crate::error::DriverResult;
use crate::once::SetupGuard;

/// Executes operations of one workload.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Creates the schema and initial data.
    async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()>;

    /// Executes one operation. `Ok` carries the outcome the workload
    /// decided on (including definite failures such as an overdraft);
    /// `Err` is left to the runtime to classify.
    async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome>;

    /// Drops the schema.
    async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()>;
}

#[async_trait]
impl<H: OperationHandler + ?Sized> OperationHandler for Arc<H> {
    async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        (**self).setup(conn).await
    }

    async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
        (**self).invoke(conn, op).await
    }

    async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        (**self).teardown(conn).await
    }
}

/// Runs the inner handler's setup and teardown at most once per run,
/// however many processes call them.
#[derive(Debug, Clone)]
pub struct Guarded<H> {
    inner: H,
    guard: SetupGuard,
}

impl<H> Guarded<H> {
    /// Wraps `inner` with the run's guard.
    pub fn new(inner: H, guard: SetupGuard) -> Self {
        Self { inner, guard }
    }

    /// Returns the wrapped handler.
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

/// Wraps a handler so its setup and teardown run once per run.
pub fn guarded<H: OperationHandler>(inner: H, guard: SetupGuard) -> Guarded<H> {
    Guarded::new(inner, guard)
}

#[async_trait]
impl<H: OperationHandler> OperationHandler for Guarded<H> {
    async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        if self.guard.claim_setup() {
            debug!(node = %conn.node(), "Running setup");
            self.inner.setup(conn).await
        } else {
            debug!(node = %conn.node(), "Setup already claimed, skipping");
            Ok(())
        }
    }

    async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
        self.inner.invoke(conn, op).await
    }

    async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()> {
        if self.guard.claim_teardown() {
            debug!(node = %conn.node(), "Running teardown");
            self.inner.teardown(conn).await
        } else {
            debug!(node = %conn.node(), "Teardown already claimed, skipping");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connector;
    use crate::memory::MemoryCluster;
    use faultline_core::NodeId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        setups: AtomicUsize,
        teardowns: AtomicUsize,
    }

    #[async_trait]
    impl OperationHandler for Counting {
        async fn setup(&self, _conn: &mut dyn Connection) -> DriverResult<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn invoke(&self, _conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
            Ok(Outcome::Ok(op.value.clone()))
        }

        async fn teardown(&self, _conn: &mut dyn Connection) -> DriverResult<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_guarded_runs_setup_once() {
        let cluster = MemoryCluster::new(&[NodeId::from("n1"), NodeId::from("n2")]);
        let inner = Arc::new(Counting::default());
        let handler = guarded(inner.clone(), SetupGuard::new());

        let mut tasks = Vec::new();
        for node in ["n1", "n2", "n1", "n2", "n1"] {
            let handler = handler.clone();
            let cluster = cluster.clone();
            tasks.push(tokio::spawn(async move {
                let mut conn = cluster.connect(&NodeId::from(node)).await.unwrap();
                handler.setup(conn.as_mut()).await.unwrap();
                handler.teardown(conn.as_mut()).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(inner.setups.load(Ordering::SeqCst), 1);
        assert_eq!(inner.teardowns.load(Ordering::SeqCst), 1);
    }
}
