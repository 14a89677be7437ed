//! Node agent records and the node agent installation capability.
//!
//! The node agent runs on every managed machine and converges packages,
//! firewall and networking locally. Orbiter only writes its desired record
//! and reads back what the agent reports.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::infra::Machine;

/// A package version with optional configuration files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl Package {
    /// Marker version asking the agent to uninstall a package.
    pub const REMOVED: &'static str = "removed";

    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            config: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, name: &str, content: String) -> Self {
        self.config.insert(name.to_string(), content);
        self
    }

    pub fn removed() -> Self {
        Self::new(Self::REMOVED)
    }

    pub fn is_empty(&self) -> bool {
        self.version.is_empty() && self.config.is_empty()
    }
}

/// Software a node agent installs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Software {
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub container_runtime: Package,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub kubelet: Package,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub kubeadm: Package,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub kubectl: Package,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub keepalived: Package,
    #[serde(default, skip_serializing_if = "Package::is_empty")]
    pub nginx: Package,
}

impl Software {
    fn packages(&self) -> [&Package; 6] {
        [
            &self.container_runtime,
            &self.kubelet,
            &self.kubeadm,
            &self.kubectl,
            &self.keepalived,
            &self.nginx,
        ]
    }

    fn packages_mut(&mut self) -> [&mut Package; 6] {
        [
            &mut self.container_runtime,
            &mut self.kubelet,
            &mut self.kubeadm,
            &mut self.kubectl,
            &mut self.keepalived,
            &mut self.nginx,
        ]
    }

    /// Fills every empty package from `other`, keeping explicit values.
    pub fn merge(&mut self, other: &Software) {
        for (mine, theirs) in self.packages_mut().into_iter().zip(other.packages()) {
            if mine.is_empty() && !theirs.is_empty() {
                *mine = theirs.clone();
            }
        }
    }

    /// Replaces every package `other` defines.
    pub fn overwrite(&mut self, other: &Software) {
        for (mine, theirs) in self.packages_mut().into_iter().zip(other.packages()) {
            if !theirs.is_empty() {
                *mine = theirs.clone();
            }
        }
    }

    /// Whether every package `other` defines is present here unchanged.
    pub fn defines(&self, other: &Software) -> bool {
        self.packages()
            .into_iter()
            .zip(other.packages())
            .all(|(mine, theirs)| theirs.is_empty() || mine == theirs)
    }
}

/// A port the firewall opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub port: String,
    pub protocol: String,
}

impl Port {
    pub fn tcp(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            protocol: "tcp".to_string(),
        }
    }
}

/// Named ports that must be open on a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firewall(pub BTreeMap<String, Port>);

impl Firewall {
    /// Adds every port not yet present. Returns whether anything was added.
    pub fn merge(&mut self, other: &Firewall) -> bool {
        let mut changed = false;
        for (name, port) in &other.0 {
            if !self.0.contains_key(name) {
                self.0.insert(name.clone(), port.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn contains(&self, other: &Firewall) -> bool {
        other.0.iter().all(|(name, port)| self.0.get(name) == Some(port))
    }
}

/// What orbiter wants a node agent to converge to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentSpec {
    #[serde(default)]
    pub software: Software,
    #[serde(default)]
    pub firewall: Firewall,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_requested: Option<DateTime<Utc>>,
}

/// What a node agent reports about its machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentCurrent {
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub software: Software,
    #[serde(default)]
    pub open: Firewall,
    #[serde(default)]
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booted_at: Option<DateTime<Utc>>,
}

/// Desired node agent records by machine id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAgentsDesired {
    #[serde(default)]
    pub agents: BTreeMap<String, NodeAgentSpec>,
}

/// Reported node agent records by machine id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAgentsCurrent {
    #[serde(default)]
    pub agents: BTreeMap<String, NodeAgentCurrent>,
}

/// Shared handle on the node agent records of one reconciliation pass.
///
/// Desired records are written concurrently by fan-out tasks; current
/// records are read only.
#[derive(Debug, Clone, Default)]
pub struct NodeAgents {
    desired: Arc<Mutex<NodeAgentsDesired>>,
    current: Arc<NodeAgentsCurrent>,
}

impl NodeAgents {
    pub fn new(desired: NodeAgentsDesired, current: NodeAgentsCurrent) -> Self {
        Self {
            desired: Arc::new(Mutex::new(desired)),
            current: Arc::new(current),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeAgentsDesired> {
        self.desired.lock().expect("node agents lock poisoned")
    }

    pub fn current(&self, id: &str) -> Option<&NodeAgentCurrent> {
        self.current.agents.get(id)
    }

    pub fn desired(&self, id: &str) -> Option<NodeAgentSpec> {
        self.lock().agents.get(id).cloned()
    }

    /// Mutates the desired record of `id`, creating it if necessary.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut NodeAgentSpec) -> R) -> R {
        let mut desired = self.lock();
        f(desired.agents.entry(id.to_string()).or_default())
    }

    pub fn remove(&self, id: &str) {
        self.lock().agents.remove(id);
    }

    /// Whether the agent of `id` reports everything its desired record asks for.
    pub fn converged(&self, id: &str) -> bool {
        let Some(current) = self.current(id) else {
            return false;
        };
        let desired = self.desired(id).unwrap_or_default();
        current.software.defines(&desired.software) && current.open.contains(&desired.firewall)
    }

    pub fn desired_snapshot(&self) -> NodeAgentsDesired {
        self.lock().clone()
    }
}

/// Installs and checks the node agent on a machine.
#[async_trait]
pub trait NodeAgentInstaller: Send + Sync {
    /// Whether the agent runs at version `commit`.
    async fn running(&self, machine: &dyn Machine, commit: &str) -> Result<bool>;

    async fn install(&self, machine: &dyn Machine, commit: &str) -> Result<()>;

    async fn uninstall(&self, machine: &dyn Machine) -> Result<()>;
}

/// Ensures the agent runs at `commit`, installing it if needed.
pub async fn ensure_node_agent(
    installer: &dyn NodeAgentInstaller,
    machine: &dyn Machine,
    commit: &str,
) -> Result<bool> {
    if installer.running(machine, commit).await? {
        return Ok(true);
    }
    installer.install(machine, commit).await?;
    Ok(false)
}

const UNIT_NAME: &str = "orbiter-node-agent";
const BINARY_PATH: &str = "/usr/local/bin/orbiter-node-agent";

/// Runs the node agent as a systemd service.
#[derive(Debug, Clone)]
pub struct SystemdNodeAgent {
    download_url: String,
}

impl SystemdNodeAgent {
    pub fn new(download_url: impl Into<String>) -> Self {
        Self {
            download_url: download_url.into(),
        }
    }

    fn unit(&self) -> String {
        format!(
            "[Unit]\nDescription=orbiter node agent\nAfter=network.target\n\n\
             [Service]\nExecStart={BINARY_PATH}\nRestart=always\nRestartSec=10\n\n\
             [Install]\nWantedBy=multi-user.target\n"
        )
    }
}

#[async_trait]
impl NodeAgentInstaller for SystemdNodeAgent {
    async fn running(&self, machine: &dyn Machine, commit: &str) -> Result<bool> {
        let cmd = format!("systemctl is-active {UNIT_NAME} && {BINARY_PATH} --version");
        match machine.execute(None, &cmd).await {
            Ok(out) => Ok(String::from_utf8_lossy(&out).contains(commit)),
            Err(Error::Command { .. }) => {
                debug!(machine = machine.id(), "Node agent not running");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn install(&self, machine: &dyn Machine, commit: &str) -> Result<()> {
        info!(machine = machine.id(), commit, "Installing node agent");
        machine
            .execute(
                None,
                &format!(
                    "sudo curl -sSfL {}/{}/orbiter-node-agent -o {BINARY_PATH} && sudo chmod +x {BINARY_PATH}",
                    self.download_url.trim_end_matches('/'),
                    commit
                ),
            )
            .await?;
        machine
            .write_file(
                &format!("/etc/systemd/system/{UNIT_NAME}.service"),
                self.unit().as_bytes(),
                0o644,
            )
            .await?;
        machine
            .execute(
                None,
                &format!("sudo systemctl daemon-reload && sudo systemctl enable --now {UNIT_NAME} && sudo systemctl restart {UNIT_NAME}"),
            )
            .await?;
        Ok(())
    }

    async fn uninstall(&self, machine: &dyn Machine) -> Result<()> {
        info!(machine = machine.id(), "Uninstalling node agent");
        machine
            .execute(
                None,
                &format!(
                    "sudo systemctl disable --now {UNIT_NAME}; sudo rm -f /etc/systemd/system/{UNIT_NAME}.service {BINARY_PATH}"
                ),
            )
            .await
            .map(|_| ())
    }
}
