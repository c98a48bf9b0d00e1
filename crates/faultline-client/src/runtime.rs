//! Per-process client runtime.
//!
//! A [`ClientRuntime`] owns one process's connection and drives its
//! lifecycle `closed → open → active → closed`. [`ClientRuntime::invoke`]
//! turns every invocation into exactly one completion: driver errors are
//! classified, "try again" errors are retried with backoff, and calls that
//! outlive their deadline are recorded as indeterminate after the
//! connection is thrown away.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use faultline_core::{NodeId, Operation, Outcome, ProcessId};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::classify::{Disposition, classify, error_value};
use crate::connection::{Connection, Connector};
use crate::error::{ClientError, DriverError, DriverResult, Result};
use crate::handler::OperationHandler;
use crate::retry::RetryPolicy;

/// Timeouts and retry behaviour of the client runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for one attempt of an operation, and for setup and teardown.
    pub op_timeout_ms: u64,
    /// Deadline for opening a connection.
    pub connect_timeout_ms: u64,
    /// Pause before failing on a connection that is not ready.
    pub not_ready_delay_ms: u64,
    /// Retry budget for "try again" errors.
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            not_ready_delay_ms: 1_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Operation deadline.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Connect deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Not-ready pause.
    pub fn not_ready_delay(&self) -> Duration {
        Duration::from_millis(self.not_ready_delay_ms)
    }
}

async fn connect(
    connector: &dyn Connector,
    node: &NodeId,
    deadline: Duration,
) -> DriverResult<Box<dyn Connection>> {
    match timeout(deadline, connector.connect(node)).await {
        Ok(res) => res,
        Err(_) => Err(DriverError::Timeout(deadline)),
    }
}

/// Lifecycle state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection.
    Closed,
    /// Connected, setup not yet run.
    Open,
    /// Connected and set up; accepts operations.
    Active,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Closed => "closed",
            ClientState::Open => "open",
            ClientState::Active => "active",
        };
        f.write_str(s)
    }
}

/// The client of one logical process.
pub struct ClientRuntime<H> {
    process: ProcessId,
    node: NodeId,
    connector: Arc<dyn Connector>,
    handler: H,
    config: ClientConfig,
    conn: Option<Box<dyn Connection>>,
    state: ClientState,
    rng: ChaCha8Rng,
}

impl<H: OperationHandler> ClientRuntime<H> {
    /// Creates a closed client for `process`, bound to `node`.
    pub fn new(
        process: ProcessId,
        node: NodeId,
        connector: Arc<dyn Connector>,
        handler: H,
        config: ClientConfig,
    ) -> Self {
        Self {
            process,
            node,
            connector,
            handler,
            config,
            conn: None,
            state: ClientState::Closed,
            rng: ChaCha8Rng::seed_from_u64(u64::from(process.inner())),
        }
    }

    /// Seeds the backoff jitter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed ^ u64::from(self.process.inner()));
        self
    }

    /// Returns the process this client serves.
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Returns the node this client connects to.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Returns whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the handler.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn expect_state(&self, allowed: &[ClientState], call: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ClientError::InvalidState(format!(
                "{call} called on a {} client",
                self.state
            )))
        }
    }

    async fn ensure_connected(&mut self) -> DriverResult<()> {
        if self.conn.is_none() {
            trace!(process = %self.process, node = %self.node, "Reconnecting");
            let deadline = self.config.connect_timeout();
            self.conn = Some(connect(self.connector.as_ref(), &self.node, deadline).await?);
        }
        Ok(())
    }

    /// Drops the connection; the next call reopens it.
    fn invalidate(&mut self) {
        if self.conn.take().is_some() {
            debug!(process = %self.process, node = %self.node, "Connection invalidated");
        }
    }

    /// Opens the connection.
    pub async fn open(&mut self) -> Result<()> {
        self.expect_state(&[ClientState::Closed], "open")?;
        let deadline = self.config.connect_timeout();
        let conn = connect(self.connector.as_ref(), &self.node, deadline)
            .await
            .map_err(|source| ClientError::Connect {
                node: self.node.to_string(),
                source,
            })?;
        self.conn = Some(conn);
        self.state = ClientState::Open;
        debug!(process = %self.process, node = %self.node, "Client opened");
        Ok(())
    }

    /// Runs the handler's setup and activates the client.
    pub async fn setup(&mut self) -> Result<()> {
        self.expect_state(&[ClientState::Open], "setup")?;
        let deadline = self.config.op_timeout();
        self.ensure_connected().await.map_err(ClientError::Setup)?;
        let Some(conn) = self.conn.as_deref_mut() else {
            return Err(ClientError::InvalidState("no connection".into()));
        };
        let res = match timeout(deadline, self.handler.setup(conn)).await {
            Ok(res) => res,
            Err(_) => Err(DriverError::Timeout(deadline)),
        };
        if let Err(e) = res {
            self.invalidate();
            return Err(ClientError::Setup(e));
        }
        self.state = ClientState::Active;
        Ok(())
    }

    /// Executes `op` and returns its completion.
    ///
    /// The completion is `ok`, `fail` or `info`, never an error. Errors are
    /// returned only when the client is not active.
    pub async fn invoke(&mut self, op: &Operation) -> Result<Operation> {
        self.expect_state(&[ClientState::Active], "invoke")?;
        let attempts = self.config.retry.attempts();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;

            if let Err(err) = self.ensure_connected().await {
                break self.connect_failure(err).await;
            }

            let err = match self.attempt(op).await {
                Ok(outcome) => break outcome,
                Err(err) => err,
            };

            match classify(&err, self.config.not_ready_delay()) {
                Disposition::Retry if attempt < attempts => {
                    let delay = self.config.retry.backoff(attempt, &mut self.rng);
                    debug!(
                        process = %self.process,
                        f = %op.f,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Disposition::Retry => {
                    warn!(process = %self.process, f = %op.f, attempts, "Retry budget exhausted");
                    break Outcome::Fail(json!(["try-again", attempt]));
                }
                Disposition::Complete {
                    outcome,
                    invalidate,
                } => {
                    if invalidate {
                        self.invalidate();
                    }
                    break outcome;
                }
                Disposition::DelayThenComplete { delay, outcome } => {
                    tokio::time::sleep(delay).await;
                    self.invalidate();
                    break outcome;
                }
            }
        };

        trace!(process = %self.process, f = %op.f, outcome = ?outcome.op_type(), "Operation completed");
        Ok(op.complete(outcome))
    }

    async fn attempt(&mut self, op: &Operation) -> DriverResult<Outcome> {
        let deadline = self.config.op_timeout();
        let Some(conn) = self.conn.as_deref_mut() else {
            return Err(DriverError::ConnectionClosed("no connection".into()));
        };
        match timeout(deadline, self.handler.invoke(conn, op)).await {
            Ok(res) => res,
            Err(_) => Err(DriverError::Timeout(deadline)),
        }
    }

    /// The operation was never sent, so a failed reconnect is a definite
    /// `fail`.
    async fn connect_failure(&mut self, err: DriverError) -> Outcome {
        debug!(process = %self.process, node = %self.node, error = %err, "Reconnect failed");
        if matches!(err, DriverError::ConnectionNotReady(_)) {
            let delay = self.config.not_ready_delay();
            tokio::time::sleep(delay).await;
        }
        Outcome::Fail(error_value(&err))
    }

    /// Runs the handler's teardown.
    pub async fn teardown(&mut self) -> Result<()> {
        self.expect_state(&[ClientState::Open, ClientState::Active], "teardown")?;
        let deadline = self.config.op_timeout();
        self.ensure_connected().await.map_err(ClientError::Teardown)?;
        let Some(conn) = self.conn.as_deref_mut() else {
            return Err(ClientError::InvalidState("no connection".into()));
        };
        let res = match timeout(deadline, self.handler.teardown(conn)).await {
            Ok(res) => res,
            Err(_) => Err(DriverError::Timeout(deadline)),
        };
        res.map_err(ClientError::Teardown)
    }

    /// Closes the connection. Closing a closed client does nothing.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let deadline = self.config.connect_timeout();
            match timeout(deadline, conn.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(process = %self.process, error = %e, "Close failed"),
                Err(_) => debug!(process = %self.process, "Close timed out"),
            }
        }
        if self.state != ClientState::Closed {
            debug!(process = %self.process, node = %self.node, "Client closed");
        }
        self.state = ClientState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InjectPoint, MemoryCluster};
    use async_trait::async_trait;
    use serde_json::Value;

    const TABLE: &str = "register";

    struct Register;

    #[async_trait]
    impl OperationHandler for Register {
        async fn setup(&self, conn: &mut dyn Connection) -> DriverResult<()> {
            conn.create_table(TABLE).await?;
            conn.upsert(TABLE, 0, 0).await
        }

        async fn invoke(&self, conn: &mut dyn Connection, op: &Operation) -> DriverResult<Outcome> {
            match op.f.as_str() {
                "read" => Ok(Outcome::Ok(json!(conn.read(TABLE, 0).await?))),
                "write" => {
                    let v = op.value.as_i64().unwrap_or_default();
                    conn.upsert(TABLE, 0, v).await?;
                    Ok(Outcome::Ok(op.value.clone()))
                }
                other => Ok(Outcome::Fail(json!(["unknown-function", other]))),
            }
        }

        async fn teardown(&self, conn: &mut dyn Connection) -> DriverResult<()> {
            conn.drop_table(TABLE).await
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            op_timeout_ms: 100,
            connect_timeout_ms: 100,
            not_ready_delay_ms: 250,
            retry: RetryPolicy::default().with_max_attempts(3),
        }
    }

    async fn active(cluster: &MemoryCluster) -> ClientRuntime<Register> {
        let mut client = ClientRuntime::new(
            ProcessId(0),
            NodeId::from("n1"),
            Arc::new(cluster.clone()),
            Register,
            config(),
        );
        client.open().await.unwrap();
        client.setup().await.unwrap();
        client
    }

    fn read() -> Operation {
        Operation::invoke(ProcessId(0), "read", Value::Null)
    }

    fn cluster() -> MemoryCluster {
        MemoryCluster::new(&[NodeId::from("n1"), NodeId::from("n2")])
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let cluster = cluster();
        let mut client = ClientRuntime::new(
            ProcessId(3),
            NodeId::from("n2"),
            Arc::new(cluster.clone()),
            Register,
            config(),
        );
        assert_eq!(client.state(), ClientState::Closed);
        assert!(matches!(
            client.invoke(&read()).await,
            Err(ClientError::InvalidState(_))
        ));

        client.open().await.unwrap();
        assert_eq!(client.state(), ClientState::Open);
        assert!(matches!(client.open().await, Err(ClientError::InvalidState(_))));

        client.setup().await.unwrap();
        assert_eq!(client.state(), ClientState::Active);

        let write = Operation::invoke(ProcessId(3), "write", json!(7));
        let done = client.invoke(&write).await.unwrap();
        assert!(done.op_type == faultline_core::OpType::Ok);
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.value, json!(7));

        client.teardown().await.unwrap();
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
        assert!(cluster.table(TABLE).await.is_none());
    }

    #[tokio::test]
    async fn test_open_failure() {
        let cluster = cluster();
        cluster.set_available(&NodeId::from("n1"), false);
        let mut client = ClientRuntime::new(
            ProcessId(0),
            NodeId::from("n1"),
            Arc::new(cluster),
            Register,
            config(),
        );
        let err = client.open().await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_again_is_retried() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        cluster.inject(InjectPoint::Read, DriverError::TryAgain("restart read".into()));
        cluster.inject(InjectPoint::Read, DriverError::TryAgain("restart read".into()));

        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Ok);
        assert_eq!(done.value, json!(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        for _ in 0..3 {
            cluster.inject(InjectPoint::Read, DriverError::TryAgain("busy".into()));
        }

        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Fail);
        assert_eq!(done.error, Some(json!(["try-again", 3])));
    }

    #[tokio::test]
    async fn test_definite_failures() {
        let cluster = cluster();
        let mut client = active(&cluster).await;

        cluster.inject(InjectPoint::Read, DriverError::Rollback("conflict".into()));
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.error, Some(json!(["rollback", "conflict"])));

        cluster.inject(
            InjectPoint::Read,
            DriverError::batch(DriverError::OperationExpired("late".into())),
        );
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Fail);
        assert_eq!(done.error, Some(json!(["batch", "operation-expired", "late"])));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_errors_are_indeterminate() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        cluster.inject(InjectPoint::Read, DriverError::Other("disk on fire".into()));
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Info);
        assert_eq!(done.error, Some(json!(["driver-error", "disk on fire"])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_invalidates_connection() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        let opened = cluster.connections();

        cluster.hang_next(InjectPoint::Read);
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Info);
        assert_eq!(done.error, Some(json!(["timeout"])));
        assert!(!client.is_connected());

        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Ok);
        assert_eq!(cluster.connections(), opened + 1);
    }

    #[tokio::test]
    async fn test_node_loss() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        let node = NodeId::from("n1");

        cluster.set_available(&node, false);
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Info);
        assert!(!client.is_connected());

        // The reconnect is refused, so the next operation never left.
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Fail);
        assert_eq!(done.error.as_ref().and_then(|e| e.get(0)), Some(&json!("connection-refused")));

        cluster.set_available(&node, true);
        let done = client.invoke(&read()).await.unwrap();
        assert_eq!(done.op_type, faultline_core::OpType::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_delays_then_fails() {
        let cluster = cluster();
        let mut client = active(&cluster).await;
        cluster.set_available(&NodeId::from("n1"), false);
        client.invoke(&read()).await.unwrap();
        cluster.set_available(&NodeId::from("n1"), true);

        cluster.inject(InjectPoint::Connect, DriverError::ConnectionNotReady("warming up".into()));
        let started = tokio::time::Instant::now();
        let done = client.invoke(&read()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert_eq!(done.op_type, faultline_core::OpType::Fail);
        assert_eq!(done.error, Some(json!(["connection-not-ready", "warming up"])));
    }
}
