//! Process faults.
//!
//! Both faults pick one random node on `start` and act on every configured
//! role there. `stop` brings the roles back and waits until they answer.

use async_trait::async_trait;
use faultline_core::NodeId;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::context::FaultContext;
use crate::controller::{Role, Signal};
use crate::error::Result;
use crate::traits::{Fault, FaultStatus};

/// Registry-style name: `start-<verb>-<tserver|master|node>`.
fn fault_name(verb: &str, roles: &[Role]) -> String {
    let target = match roles {
        [role] => role.name(),
        _ => "node",
    };
    format!("start-{verb}-{target}")
}

fn normalize(roles: &[Role]) -> Vec<Role> {
    let mut roles = roles.to_vec();
    roles.sort();
    roles.dedup();
    roles
}

/// Waits for every role on `node`, collecting failures. Returns true if all
/// of them answered.
async fn await_node(
    ctx: &FaultContext,
    node: &NodeId,
    roles: &[Role],
    failures: &mut Vec<String>,
) -> bool {
    let mut ready = true;
    for role in roles {
        if let Err(e) = ctx.await_role(node, *role).await {
            failures.push(e.to_string());
            ready = false;
        }
    }
    ready
}

/// Keeps the nodes that did not come back, so the next stop retries them.
fn settle(active: &mut Option<Vec<NodeId>>, fault: &str, pending: Vec<NodeId>) {
    if pending.is_empty() {
        *active = None;
    } else {
        warn!(fault = %fault, nodes = ?pending, "Nodes not recovered, stop will retry them");
        *active = Some(pending);
    }
}

/// Kills database roles on a random node and restarts them on stop.
///
/// With `SIGTERM` this is a graceful stop, with `SIGKILL` a crash. Listing
/// both roles kills every local database process.
#[derive(Debug)]
pub struct ProcessKill {
    name: String,
    roles: Vec<Role>,
    signal: Signal,
    active: Mutex<Option<Vec<NodeId>>>,
}

impl ProcessKill {
    /// Creates a kill fault for the given roles.
    pub fn new(roles: &[Role], signal: Signal) -> Self {
        let roles = normalize(roles);
        let verb = if signal == Signal::Kill { "kill" } else { "stop" };
        Self {
            name: fault_name(verb, &roles),
            roles,
            signal,
            active: Mutex::new(None),
        }
    }

    /// Creates a graceful stop using SIGTERM.
    pub fn graceful(roles: &[Role]) -> Self {
        Self::new(roles, Signal::Term)
    }

    /// Creates a forceful kill using SIGKILL.
    pub fn forceful(roles: &[Role]) -> Self {
        Self::new(roles, Signal::Kill)
    }

    /// Returns the affected roles.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Returns the signal sent on start.
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

#[async_trait]
impl Fault for ProcessKill {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Kills database processes on a random node and restarts them"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!(fault = %self.name, "Fault already active");
            return Ok(FaultStatus::AlreadyActive);
        }

        let node = ctx.random_node()?;
        // Recorded before the first call so a cancelled start still gets
        // healed by the next stop.
        *active = Some(vec![node.clone()]);
        let mut failures = Vec::new();
        for role in &self.roles {
            info!(fault = %self.name, node = %node, role = %role, signal = %self.signal, "Stopping process");
            if let Err(e) = ctx.controller().stop_role(&node, *role, self.signal).await {
                warn!(fault = %self.name, node = %node, role = %role, error = %e, "Failed to stop process");
                failures.push(e.to_string());
            }
        }

        Ok(FaultStatus::applied_with(
            vec![node],
            json!({ "signal": self.signal.name(), "roles": self.roles }),
            failures,
        ))
    }

    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        let Some(targets) = active.clone() else {
            debug!(fault = %self.name, "Fault not active");
            return Ok(FaultStatus::NotActive);
        };

        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for node in &targets {
            let mut restored = true;
            for role in &self.roles {
                info!(fault = %self.name, node = %node, role = %role, "Restarting process");
                if let Err(e) = ctx.controller().start_role(node, *role).await {
                    warn!(fault = %self.name, node = %node, role = %role, error = %e, "Failed to restart process");
                    failures.push(e.to_string());
                    restored = false;
                }
            }
            if !await_node(ctx, node, &self.roles, &mut failures).await || !restored {
                pending.push(node.clone());
            }
        }
        settle(&mut active, &self.name, pending);

        Ok(FaultStatus::recovered(targets, failures))
    }

    fn is_active(&self) -> bool {
        self.active.try_lock().map_or(true, |a| a.is_some())
    }
}

/// Suspends database roles on a random node with `SIGSTOP` and resumes them
/// with `SIGCONT` on stop.
#[derive(Debug)]
pub struct ProcessPause {
    name: String,
    roles: Vec<Role>,
    active: Mutex<Option<Vec<NodeId>>>,
}

impl ProcessPause {
    /// Creates a pause fault for the given roles.
    pub fn new(roles: &[Role]) -> Self {
        let roles = normalize(roles);
        Self {
            name: fault_name("pause", &roles),
            roles,
            active: Mutex::new(None),
        }
    }

    /// Returns the affected roles.
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

#[async_trait]
impl Fault for ProcessPause {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Pauses database processes on a random node and resumes them"
    }

    async fn start(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            debug!(fault = %self.name, "Fault already active");
            return Ok(FaultStatus::AlreadyActive);
        }

        let node = ctx.random_node()?;
        *active = Some(vec![node.clone()]);
        let mut failures = Vec::new();
        for role in &self.roles {
            info!(fault = %self.name, node = %node, role = %role, "Pausing process");
            if let Err(e) = ctx.controller().signal(&node, *role, Signal::Stop).await {
                warn!(fault = %self.name, node = %node, role = %role, error = %e, "Failed to pause process");
                failures.push(e.to_string());
            }
        }

        Ok(FaultStatus::applied_with(
            vec![node],
            json!({ "roles": self.roles }),
            failures,
        ))
    }

    async fn stop(&self, ctx: &FaultContext) -> Result<FaultStatus> {
        let mut active = self.active.lock().await;
        let Some(targets) = active.clone() else {
            debug!(fault = %self.name, "Fault not active");
            return Ok(FaultStatus::NotActive);
        };

        let mut failures = Vec::new();
        let mut pending = Vec::new();
        for node in &targets {
            let mut resumed = true;
            for role in &self.roles {
                info!(fault = %self.name, node = %node, role = %role, "Resuming process");
                if let Err(e) = ctx.controller().signal(node, *role, Signal::Cont).await {
                    warn!(fault = %self.name, node = %node, role = %role, error = %e, "Failed to resume process");
                    failures.push(e.to_string());
                    resumed = false;
                }
            }
            if !await_node(ctx, node, &self.roles, &mut failures).await || !resumed {
                pending.push(node.clone());
            }
        }
        settle(&mut active, &self.name, pending);

        Ok(FaultStatus::recovered(targets, failures))
    }

    fn is_active(&self) -> bool {
        self.active.try_lock().map_or(true, |a| a.is_some())
    }
}
