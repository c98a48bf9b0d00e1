//! Shell-backed cluster control.
//!
//! A [`Distribution`] names one supported `{OS, edition}` pair and resolves
//! everything that differs between them: package manager, install
//! directories and the default tarball. [`ShellController`] renders
//! controller calls into shell commands for a distribution and hands them to
//! a [`CommandRunner`], either [`SshRunner`] for real clusters or
//! [`DryRunRunner`] to only log what would be executed.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use faultline_core::NodeId;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::controller::{ClusterController, Grudge, PartitionProvider, Role, Signal};
use crate::error::{NemesisError, Result};

/// Default community tarball.
pub const DEFAULT_TARBALL_URL: &str =
    "https://downloads.yugabyte.com/yugabyte-ce-1.2.4.0-linux.tar.gz";

/// Operating system family of the cluster hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Debian and Ubuntu hosts (`apt-get`).
    Debian,
    /// CentOS and RHEL hosts (`yum`).
    Centos,
}

impl std::str::FromStr for Os {
    type Err = NemesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debian" | "ubuntu" => Ok(Os::Debian),
            "centos" | "rhel" => Ok(Os::Centos),
            other => Err(NemesisError::InvalidConfiguration(format!(
                "unsupported os: {other}"
            ))),
        }
    }
}

/// Database edition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    /// Single tarball, both roles share one install directory.
    Community,
    /// Separate master and tserver install directories.
    Enterprise,
}

impl std::str::FromStr for Edition {
    type Err = NemesisError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "community" | "ce" => Ok(Edition::Community),
            "enterprise" | "ee" => Ok(Edition::Enterprise),
            other => Err(NemesisError::InvalidConfiguration(format!(
                "unsupported edition: {other}"
            ))),
        }
    }
}

/// One supported `{OS, edition}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribution {
    /// Debian, community edition.
    DebianCommunity,
    /// Debian, enterprise edition.
    DebianEnterprise,
    /// CentOS, community edition.
    CentosCommunity,
    /// CentOS, enterprise edition.
    CentosEnterprise,
}

/// Filesystem and packaging details of a distribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Command prefix used to install OS packages.
    pub package_install: &'static str,
    /// OS packages required on every node.
    pub packages: &'static [&'static str],
    /// Directory holding the master binaries.
    pub master_dir: &'static str,
    /// Directory holding the tserver binaries.
    pub tserver_dir: &'static str,
    /// Root directory for data files.
    pub data_dir: &'static str,
    /// Directory for process stdout/stderr logs.
    pub log_dir: &'static str,
    /// Helper binary that shifts the wall clock by a millisecond delta.
    pub bump_time: &'static str,
}

impl Distribution {
    /// Resolves the distribution for an OS and edition.
    pub fn lookup(os: Os, edition: Edition) -> Self {
        match (os, edition) {
            (Os::Debian, Edition::Community) => Distribution::DebianCommunity,
            (Os::Debian, Edition::Enterprise) => Distribution::DebianEnterprise,
            (Os::Centos, Edition::Community) => Distribution::CentosCommunity,
            (Os::Centos, Edition::Enterprise) => Distribution::CentosEnterprise,
        }
    }

    /// Returns the OS family.
    pub fn os(&self) -> Os {
        match self {
            Distribution::DebianCommunity | Distribution::DebianEnterprise => Os::Debian,
            Distribution::CentosCommunity | Distribution::CentosEnterprise => Os::Centos,
        }
    }

    /// Returns the edition.
    pub fn edition(&self) -> Edition {
        match self {
            Distribution::DebianCommunity | Distribution::CentosCommunity => Edition::Community,
            Distribution::DebianEnterprise | Distribution::CentosEnterprise => Edition::Enterprise,
        }
    }

    /// Returns the install layout.
    pub fn layout(&self) -> Layout {
        let (package_install, packages): (&'static str, &'static [&'static str]) = match self.os()
        {
            Os::Debian => (
                "DEBIAN_FRONTEND=noninteractive apt-get install -y",
                &["curl", "ntpdate", "iptables", "python"],
            ),
            Os::Centos => ("yum install -y", &["curl", "ntpdate", "iptables", "python"]),
        };
        let (master_dir, tserver_dir) = match self.edition() {
            Edition::Community => ("/home/yugabyte", "/home/yugabyte"),
            Edition::Enterprise => ("/home/yugabyte/master", "/home/yugabyte/tserver"),
        };
        Layout {
            package_install,
            packages,
            master_dir,
            tserver_dir,
            data_dir: "/mnt/d0",
            log_dir: "/var/log/yugabyte",
            bump_time: "/opt/faultline/bump-time",
        }
    }

    /// Returns the install directory of a role.
    pub fn role_dir(&self, role: Role) -> &'static str {
        let layout = self.layout();
        match role {
            Role::Master => layout.master_dir,
            Role::TServer => layout.tserver_dir,
        }
    }

    /// Returns the process name of a role, as matched by `pkill`.
    pub fn binary(&self, role: Role) -> &'static str {
        match role {
            Role::Master => "yb-master",
            Role::TServer => "yb-tserver",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = match self.os() {
            Os::Debian => "debian",
            Os::Centos => "centos",
        };
        let edition = match self.edition() {
            Edition::Community => "community",
            Edition::Enterprise => "enterprise",
        };
        write!(f, "{os}/{edition}")
    }
}

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `-1` if the process was terminated by a signal.
    pub status: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true for a zero exit status.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes shell commands on cluster nodes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` through a shell on `node`.
    async fn run(&self, node: &NodeId, command: &str) -> Result<CommandOutput>;
}

/// Runs commands over `ssh`, as root via `sudo`.
#[derive(Debug, Clone)]
pub struct SshRunner {
    user: String,
    port: u16,
    timeout: Duration,
    sudo: bool,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            timeout: Duration::from_secs(60),
            sudo: false,
        }
    }
}

impl SshRunner {
    /// Creates a runner logging in as `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    /// Sets the ssh port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the per-command timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Wraps every command in `sudo sh -c`.
    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    fn remote_command(&self, command: &str) -> String {
        if self.sudo {
            format!("sudo -n sh -c {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, node: &NodeId, command: &str) -> Result<CommandOutput> {
        let remote = self.remote_command(command);
        debug!(node = %node, command = %remote, "Executing remote command");

        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-p")
            .arg(self.port.to_string())
            .arg(format!("{}@{}", self.user, node))
            .arg(&remote)
            .kill_on_drop(true);

        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| NemesisError::Timeout(self.timeout))??;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Logs commands instead of executing them, and remembers them.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    executed: Mutex<Vec<(NodeId, String)>>,
}

impl DryRunRunner {
    /// Creates an empty dry-run runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every command seen so far, in order.
    pub fn commands(&self) -> Vec<(NodeId, String)> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, node: &NodeId, command: &str) -> Result<CommandOutput> {
        info!(node = %node, command = %command, "Dry-run: would execute");
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((node.clone(), command.to_string()));
        Ok(CommandOutput::default())
    }
}

/// Quotes a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Controls a cluster by running shell commands on its nodes.
pub struct ShellController<R> {
    distribution: Distribution,
    nodes: Vec<NodeId>,
    tarball_url: String,
    replication_factor: usize,
    runner: R,
}

impl<R: CommandRunner> ShellController<R> {
    /// Master RPC port.
    pub const MASTER_PORT: u16 = 7100;
    /// Tserver RPC port.
    pub const TSERVER_PORT: u16 = 9100;

    /// Creates a controller for the given nodes.
    pub fn new(distribution: Distribution, nodes: Vec<NodeId>, runner: R) -> Self {
        let replication_factor = nodes.len().clamp(1, 3);
        Self {
            distribution,
            nodes,
            tarball_url: DEFAULT_TARBALL_URL.to_string(),
            replication_factor,
            runner,
        }
    }

    /// Sets the tarball to install from.
    pub fn tarball_url(mut self, url: impl Into<String>) -> Self {
        self.tarball_url = url.into();
        self
    }

    /// Sets the replication factor passed to the masters.
    pub fn replication_factor(mut self, rf: usize) -> Self {
        self.replication_factor = rf;
        self
    }

    /// Returns the command runner.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Master nodes: the first `replication_factor` nodes.
    fn master_nodes(&self) -> &[NodeId] {
        let n = self.replication_factor.min(self.nodes.len());
        &self.nodes[..n]
    }

    fn master_addresses(&self) -> String {
        self.master_nodes()
            .iter()
            .map(|n| format!("{}:{}", n, Self::MASTER_PORT))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Renders the install command for a node.
    pub fn install_command(&self) -> String {
        let layout = self.distribution.layout();
        let mut dirs = vec![layout.master_dir];
        if layout.tserver_dir != layout.master_dir {
            dirs.push(layout.tserver_dir);
        }
        let unpack = dirs
            .iter()
            .map(|dir| {
                format!(
                    "mkdir -p {dir} && curl -sSfL {url} | tar -xz -C {dir} --strip-components=1 \
                     && {dir}/bin/post_install.sh",
                    url = self.tarball_url
                )
            })
            .collect::<Vec<_>>()
            .join(" && ");
        format!(
            "{} {} && mkdir -p {} && {}",
            layout.package_install,
            layout.packages.join(" "),
            layout.log_dir,
            unpack
        )
    }

    /// Renders the start command for a role.
    pub fn start_command(&self, node: &NodeId, role: Role) -> String {
        let layout = self.distribution.layout();
        let dir = self.distribution.role_dir(role);
        let binary = self.distribution.binary(role);
        let role_args = match role {
            Role::Master => format!(
                "--master_addresses={} --rpc_bind_addresses={}:{} --replication_factor={}",
                self.master_addresses(),
                node,
                Self::MASTER_PORT,
                self.replication_factor
            ),
            Role::TServer => format!(
                "--tserver_master_addrs={} --rpc_bind_addresses={}:{}",
                self.master_addresses(),
                node,
                Self::TSERVER_PORT
            ),
        };
        format!(
            "pgrep -x {binary} >/dev/null || (cd {dir} && nohup bin/{binary} \
             --fs_data_dirs={data}/{role} {role_args} >> {log}/{role}.out 2>&1 &)",
            data = layout.data_dir,
            log = layout.log_dir,
        )
    }

    /// Renders the command that signals a role's process. Never fails when
    /// the process is absent.
    pub fn signal_command(&self, role: Role, signal: Signal) -> String {
        format!(
            "pkill -{} -x {} || true",
            signal.name(),
            self.distribution.binary(role)
        )
    }

    /// Renders the probe command for a role.
    pub fn await_command(&self, role: Role) -> String {
        let admin = format!(
            "{}/bin/yb-admin --master_addresses {}",
            self.distribution.role_dir(Role::Master),
            self.master_addresses()
        );
        match role {
            Role::Master => format!("{admin} list_all_masters"),
            Role::TServer => format!("{admin} list_all_tablet_servers"),
        }
    }

    async fn run_checked(&self, node: &NodeId, action: &str, command: &str) -> Result<()> {
        let output = self.runner.run(node, command).await?;
        if output.success() {
            Ok(())
        } else {
            warn!(
                node = %node,
                action = action,
                status = output.status,
                stderr = %output.stderr.trim(),
                "Remote command failed"
            );
            Err(NemesisError::command_failed(node, command, output.stderr.trim()))
        }
    }
}

#[async_trait]
impl<R: CommandRunner> ClusterController for ShellController<R> {
    async fn install(&self, node: &NodeId) -> Result<()> {
        info!(node = %node, distribution = %self.distribution, "Installing database");
        self.run_checked(node, "install", &self.install_command()).await
    }

    async fn start_master(&self, node: &NodeId) -> Result<()> {
        if !self.master_nodes().contains(node) {
            debug!(node = %node, "Node runs no master, skipping start");
            return Ok(());
        }
        self.run_checked(node, "start_master", &self.start_command(node, Role::Master))
            .await
    }

    async fn start_tserver(&self, node: &NodeId) -> Result<()> {
        self.run_checked(node, "start_tserver", &self.start_command(node, Role::TServer))
            .await
    }

    async fn stop_master(&self, node: &NodeId, signal: Signal) -> Result<()> {
        self.run_checked(node, "stop_master", &self.signal_command(Role::Master, signal))
            .await
    }

    async fn stop_tserver(&self, node: &NodeId, signal: Signal) -> Result<()> {
        self.run_checked(node, "stop_tserver", &self.signal_command(Role::TServer, signal))
            .await
    }

    async fn signal(&self, node: &NodeId, role: Role, signal: Signal) -> Result<()> {
        self.run_checked(node, "signal", &self.signal_command(role, signal))
            .await
    }

    async fn wipe(&self, node: &NodeId) -> Result<()> {
        let layout = self.distribution.layout();
        let command = format!("rm -rf {}/* {}/*", layout.data_dir, layout.log_dir);
        self.run_checked(node, "wipe", &command).await
    }

    async fn await_masters(&self, node: &NodeId) -> Result<()> {
        self.run_checked(node, "await_masters", &self.await_command(Role::Master))
            .await
    }

    async fn await_tservers(&self, node: &NodeId) -> Result<()> {
        self.run_checked(node, "await_tservers", &self.await_command(Role::TServer))
            .await
    }

    async fn bump_clock(&self, node: &NodeId, delta_ms: i64) -> Result<()> {
        let command = format!("{} {}", self.distribution.layout().bump_time, delta_ms);
        self.run_checked(node, "bump_clock", &command).await
    }

    async fn reset_clock(&self, node: &NodeId) -> Result<()> {
        self.run_checked(node, "reset_clock", "ntpdate -p 1 -b time.google.com")
            .await
    }
}

#[async_trait]
impl<R: CommandRunner> PartitionProvider for ShellController<R> {
    async fn drop_all(&self, grudge: &Grudge) -> Result<()> {
        let mut failures = Vec::new();
        for (node, frenemies) in grudge {
            if frenemies.is_empty() {
                continue;
            }
            let command = frenemies
                .iter()
                .map(|peer| format!("iptables -A INPUT -s {peer} -j DROP -w"))
                .collect::<Vec<_>>()
                .join(" && ");
            if let Err(e) = self.run_checked(node, "drop_all", &command).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NemesisError::Network(failures.join("; ")))
        }
    }

    async fn heal(&self, nodes: &[NodeId]) -> Result<()> {
        let mut failures = Vec::new();
        for node in nodes {
            if let Err(e) = self
                .run_checked(node, "heal", "iptables -F -w && iptables -X -w")
                .await
            {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NemesisError::Network(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn nodes() -> Vec<NodeId> {
        ["n1", "n2", "n3", "n4", "n5"].into_iter().map(NodeId::from).collect()
    }

    #[test]
    fn test_lookup_covers_every_pair() {
        for os in [Os::Debian, Os::Centos] {
            for edition in [Edition::Community, Edition::Enterprise] {
                let d = Distribution::lookup(os, edition);
                assert_eq!(d.os(), os);
                assert_eq!(d.edition(), edition);
            }
        }
        assert_eq!(
            Distribution::lookup(Os::Centos, Edition::Enterprise).to_string(),
            "centos/enterprise"
        );
    }

    #[test]
    fn test_layout_differs_by_edition() {
        let ce = Distribution::DebianCommunity;
        let ee = Distribution::DebianEnterprise;
        assert_eq!(ce.role_dir(Role::Master), ce.role_dir(Role::TServer));
        assert_ne!(ee.role_dir(Role::Master), ee.role_dir(Role::TServer));
        assert!(Distribution::CentosCommunity
            .layout()
            .package_install
            .starts_with("yum"));
    }

    #[test]
    fn test_parse_os_and_edition() {
        assert_eq!("ubuntu".parse::<Os>().unwrap(), Os::Debian);
        assert_eq!("ee".parse::<Edition>().unwrap(), Edition::Enterprise);
        assert!("windows".parse::<Os>().is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
    }

    #[test]
    fn test_rendered_commands() {
        let ctl = ShellController::new(Distribution::DebianCommunity, nodes(), DryRunRunner::new());
        let start = ctl.start_command(&NodeId::from("n4"), Role::TServer);
        assert!(start.contains("bin/yb-tserver"));
        assert!(start.contains("--tserver_master_addrs=n1:7100,n2:7100,n3:7100"));
        assert!(start.contains("--rpc_bind_addresses=n4:9100"));

        assert_eq!(
            ctl.signal_command(Role::Master, Signal::Kill),
            "pkill -KILL -x yb-master || true"
        );
        assert!(ctl.await_command(Role::TServer).ends_with("list_all_tablet_servers"));
        assert!(ctl.install_command().contains("apt-get install -y"));
    }

    #[tokio::test]
    async fn test_dry_run_records_commands() {
        let ctl = ShellController::new(Distribution::DebianCommunity, nodes(), DryRunRunner::new());
        let n1 = NodeId::from("n1");
        let n5 = NodeId::from("n5");

        ctl.stop_tserver(&n1, Signal::Term).await.unwrap();
        // n5 is not among the first three nodes, so it runs no master.
        ctl.start_master(&n5).await.unwrap();

        let mut grudge = Grudge::new();
        grudge.insert(n1.clone(), BTreeSet::from([NodeId::from("n2"), NodeId::from("n3")]));
        ctl.drop_all(&grudge).await.unwrap();
        ctl.heal(&[n1.clone()]).await.unwrap();

        let commands = ctl.runner().commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].1, "pkill -TERM -x yb-tserver || true");
        assert_eq!(
            commands[1].1,
            "iptables -A INPUT -s n2 -j DROP -w && iptables -A INPUT -s n3 -j DROP -w"
        );
        assert!(commands.iter().all(|(node, _)| node == &n1));
    }
}
