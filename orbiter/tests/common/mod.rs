//! Shared fakes for orbiter integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use orbiter::error::{Error, Result};
use orbiter::infra::{Connector, Machine, Machines, MachinesService, Pool, Remote, Requirements, ServicePool};
use orbiter::kinds::clusters::kubernetes::desired::Networking;
use orbiter::kinds::clusters::kubernetes::ensure::{ClusterEnsure, ClusterStatus, Member};
use orbiter::kinds::clusters::kubernetes::{ClusterApi, InitConfig, KubernetesVersion, Node, Tier};
use orbiter::kinds::Collaborators;
use orbiter::nodeagent::{
    NodeAgentCurrent, NodeAgentInstaller, NodeAgents, NodeAgentsCurrent, NodeAgentsDesired,
};
use orbiter::OrbiterAuditLogger;

pub fn audit() -> Arc<OrbiterAuditLogger> {
    Arc::new(OrbiterAuditLogger::new_noop())
}

// ---------------------------------------------------------------------------
// Machines
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inventory {
    pools: BTreeMap<String, Vec<Arc<FakeMachine>>>,
    next: i64,
    create_calls: usize,
    fail_create: Option<usize>,
    created: usize,
    removed: usize,
    cancel_on_create: Option<CancellationToken>,
}

/// In-memory machines service. Machines are named `<pool>-<n>` and created
/// one second apart.
pub struct FakeMachinesService {
    inventory: Arc<Mutex<Inventory>>,
    requirements: Arc<Requirements>,
}

impl FakeMachinesService {
    pub fn new(pools: &[&str]) -> Arc<Self> {
        let inventory = Inventory {
            pools: pools.iter().map(|p| (p.to_string(), Vec::new())).collect(),
            ..Default::default()
        };
        Arc::new(Self {
            inventory: Arc::new(Mutex::new(inventory)),
            requirements: Arc::new(Requirements::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap()
    }

    /// Makes the `nth` create call from now on fail (1-based).
    pub fn fail_create(&self, nth: usize) {
        let mut inv = self.lock();
        inv.fail_create = Some(inv.create_calls + nth);
    }

    /// Cancels `token` as soon as a machine is requested.
    pub fn cancel_on_create(&self, token: CancellationToken) {
        self.lock().cancel_on_create = Some(token);
    }

    pub fn ids(&self, pool: &str) -> Vec<String> {
        self.lock()
            .pools
            .get(pool)
            .map(|ms| ms.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, pool: &str) -> usize {
        self.ids(pool).len()
    }

    /// Successful creates and removes so far.
    pub fn mutations(&self) -> (usize, usize) {
        let inv = self.lock();
        (inv.created, inv.removed)
    }

    pub fn pool(self: &Arc<Self>, name: &str) -> Arc<dyn Pool> {
        Arc::new(ServicePool::new(name, self.clone()))
    }
}

#[async_trait]
impl MachinesService for FakeMachinesService {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.lock().pools.keys().cloned().collect())
    }

    async fn list(&self, pool: &str) -> Result<Machines> {
        Ok(self
            .lock()
            .pools
            .get(pool)
            .map(|ms| ms.iter().map(|m| m.clone() as Arc<dyn Machine>).collect())
            .unwrap_or_default())
    }

    async fn create(&self, pool: &str) -> Result<Arc<dyn Machine>> {
        tokio::task::yield_now().await;
        let mut inv = self.lock();
        inv.create_calls += 1;
        if let Some(token) = &inv.cancel_on_create {
            token.cancel();
        }
        if inv.fail_create == Some(inv.create_calls) {
            return Err(Error::remote("quota exceeded"));
        }
        inv.next += 1;
        let machine = Arc::new(FakeMachine {
            id: format!("{pool}-{}", inv.next),
            ip: format!("10.0.0.{}", inv.next),
            pool: pool.to_string(),
            created_at: Utc.timestamp_opt(1_600_000_000 + inv.next, 0).single(),
            inventory: self.inventory.clone(),
            requirements: self.requirements.clone(),
        });
        inv.pools
            .entry(pool.to_string())
            .or_default()
            .push(machine.clone());
        inv.created += 1;
        Ok(machine)
    }

    fn requirements(&self) -> Arc<Requirements> {
        self.requirements.clone()
    }
}

pub struct FakeMachine {
    id: String,
    ip: String,
    pool: String,
    created_at: Option<DateTime<Utc>>,
    inventory: Arc<Mutex<Inventory>>,
    requirements: Arc<Requirements>,
}

impl std::fmt::Debug for FakeMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeMachine").field("id", &self.id).finish()
    }
}

#[async_trait]
impl Remote for FakeMachine {
    async fn execute(&self, _stdin: Option<&[u8]>, _cmd: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn shell(&self) -> Result<()> {
        Ok(())
    }

    async fn read_file(&self, _path: &str) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn write_file(&self, _path: &str, _content: &[u8], _mode: u32) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    fn reboot_required(&self) -> bool {
        self.requirements.reboot_required(&self.id)
    }

    fn replacement_required(&self) -> bool {
        self.requirements.replacement_required(&self.id)
    }

    async fn remove(&self) -> Result<()> {
        let mut inv = self.inventory.lock().unwrap();
        if let Some(ms) = inv.pools.get_mut(&self.pool) {
            ms.retain(|m| m.id != self.id);
        }
        inv.removed += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Remote hosts
// ---------------------------------------------------------------------------

/// A host reachable through [`FakeConnector`], with an in-memory filesystem.
#[derive(Default)]
pub struct FakeHost {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    commands: Mutex<Vec<String>>,
    down: Mutex<bool>,
    write_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeHost {
    pub fn file(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// While down, every call fails the way ssh does for an unreachable host.
    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    pub fn delay_writes(&self, delay: std::time::Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    fn reachable(&self, cmd: &str) -> Result<()> {
        if *self.down.lock().unwrap() {
            return Err(Error::Command {
                cmd: cmd.to_string(),
                status: 255,
                stderr: "ssh: connect to host port 22: Connection timed out".to_string(),
            });
        }
        Ok(())
    }

    /// Marks the host as an active pool member since `at` (RFC 3339).
    pub fn activate(&self, id: &str, at: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(format!("/var/orbiter/{id}"), at.as_bytes().to_vec());
    }
}

#[async_trait]
impl Remote for FakeHost {
    async fn execute(&self, _stdin: Option<&[u8]>, cmd: &str) -> Result<Vec<u8>> {
        self.reachable(cmd)?;
        self.commands.lock().unwrap().push(cmd.to_string());
        if let Some(path) = cmd.strip_prefix("sudo rm -f ") {
            self.files.lock().unwrap().remove(path.trim().trim_matches('\''));
        }
        Ok(Vec::new())
    }

    async fn shell(&self) -> Result<()> {
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.reachable(&format!("sudo cat {path}"))?;
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Command {
                cmd: format!("sudo cat {path}"),
                status: 1,
                stderr: "No such file or directory".to_string(),
            })
    }

    async fn write_file(&self, path: &str, content: &[u8], _mode: u32) -> Result<()> {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.reachable(&format!("sudo tee {path}"))?;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        Ok(())
    }
}

/// Hands out one [`FakeHost`] per ip.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<BTreeMap<String, Arc<FakeHost>>>,
}

impl FakeConnector {
    pub fn host(&self, ip: &str) -> Arc<FakeHost> {
        self.hosts
            .lock()
            .unwrap()
            .entry(ip.to_string())
            .or_default()
            .clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _user: &str, ip: &str, _private_keys: &[String]) -> Result<Arc<dyn Remote>> {
        Ok(self.host(ip))
    }
}

// ---------------------------------------------------------------------------
// Cluster API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Cluster {
    initialized: bool,
    nodes: BTreeMap<String, Node>,
    calls: Vec<String>,
}

/// Records every mutating cluster call and keeps a node list.
#[derive(Default)]
pub struct FakeClusterApi {
    state: Mutex<Cluster>,
}

impl FakeClusterApi {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().unwrap().nodes.get(name).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.state.lock().unwrap().nodes.keys().cloned().collect()
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, Cluster> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state
    }
}

fn ready(name: &str) -> Node {
    Node {
        name: name.to_string(),
        ready: true,
        cordoned: false,
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn nodes(&self, via: &dyn Machine) -> Result<Option<Vec<Node>>> {
        let state = self.state.lock().unwrap();
        if !state.initialized || !state.nodes.contains_key(via.id()) {
            return Ok(None);
        }
        Ok(Some(state.nodes.values().cloned().collect()))
    }

    async fn init(&self, first: &dyn Machine, _cfg: &InitConfig) -> Result<()> {
        let mut state = self.record(format!("init {}", first.id()));
        state.initialized = true;
        state.nodes.insert(first.id().to_string(), ready(first.id()));
        Ok(())
    }

    async fn join(
        &self,
        _via: &dyn Machine,
        node: &dyn Machine,
        tier: Tier,
        _cfg: &InitConfig,
    ) -> Result<()> {
        let mut state = self.record(format!("join {} {tier}", node.id()));
        state.nodes.insert(node.id().to_string(), ready(node.id()));
        Ok(())
    }

    async fn drain(&self, _via: &dyn Machine, node: &str) -> Result<()> {
        let mut state = self.record(format!("drain {node}"));
        if let Some(n) = state.nodes.get_mut(node) {
            n.cordoned = true;
        }
        Ok(())
    }

    async fn uncordon(&self, _via: &dyn Machine, node: &str) -> Result<()> {
        let mut state = self.record(format!("uncordon {node}"));
        if let Some(n) = state.nodes.get_mut(node) {
            n.cordoned = false;
        }
        Ok(())
    }

    async fn delete_node(&self, _via: &dyn Machine, node: &str) -> Result<()> {
        let mut state = self.record(format!("delete {node}"));
        state.nodes.remove(node);
        Ok(())
    }

    async fn reset(&self, node: &dyn Machine) -> Result<()> {
        let mut state = self.record(format!("reset {}", node.id()));
        state.nodes.remove(node.id());
        if state.nodes.is_empty() {
            state.initialized = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node agents
// ---------------------------------------------------------------------------

/// Installs instantly and remembers where.
#[derive(Default)]
pub struct FakeNodeAgentInstaller {
    installed: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeNodeAgentInstaller {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn installed(&self, id: &str) -> bool {
        self.installed.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl NodeAgentInstaller for FakeNodeAgentInstaller {
    async fn running(&self, machine: &dyn Machine, _commit: &str) -> Result<bool> {
        Ok(self.installed(machine.id()))
    }

    async fn install(&self, machine: &dyn Machine, commit: &str) -> Result<()> {
        self.installed.lock().unwrap().insert(machine.id().to_string());
        self.calls
            .lock()
            .unwrap()
            .push(format!("install {} {commit}", machine.id()));
        Ok(())
    }

    async fn uninstall(&self, machine: &dyn Machine) -> Result<()> {
        self.installed.lock().unwrap().remove(machine.id());
        self.calls
            .lock()
            .unwrap()
            .push(format!("uninstall {}", machine.id()));
        Ok(())
    }
}

/// What node agents report after converging to `desired`. Reboots complete
/// one second after they were requested.
pub fn report(desired: &NodeAgentsDesired) -> NodeAgentsCurrent {
    NodeAgentsCurrent {
        agents: desired
            .agents
            .iter()
            .map(|(id, spec)| {
                (
                    id.clone(),
                    NodeAgentCurrent {
                        commit: "test".to_string(),
                        software: spec.software.clone(),
                        open: spec.firewall.clone(),
                        ready: true,
                        booted_at: spec.reboot_requested.map(|at| at + Duration::seconds(1)),
                    },
                )
            })
            .collect(),
    }
}

pub fn collaborators(
    api: Arc<FakeClusterApi>,
    installer: Arc<FakeNodeAgentInstaller>,
    connector: Arc<FakeConnector>,
) -> Collaborators {
    Collaborators {
        audit: audit(),
        cluster_api: api,
        node_agent: installer,
        connector,
        commit: "test".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Cluster fixture
// ---------------------------------------------------------------------------

/// One Kubernetes cluster on a fake provider with `masters` and `workers` pools.
pub struct ClusterFixture {
    pub svc: Arc<FakeMachinesService>,
    pub api: Arc<FakeClusterApi>,
    pub status: Arc<Mutex<ClusterStatus>>,
    pub desired: NodeAgentsDesired,
    pub current: NodeAgentsCurrent,
    /// Whether node agents converge between ticks.
    pub agents_converge: bool,
    pub target: KubernetesVersion,
    pub control_plane: usize,
    pub workers: usize,
}

impl ClusterFixture {
    pub fn new(control_plane: usize, workers: usize) -> Self {
        Self {
            svc: FakeMachinesService::new(&["masters", "workers"]),
            api: Arc::new(FakeClusterApi::default()),
            status: Arc::new(Mutex::new(ClusterStatus::default())),
            desired: NodeAgentsDesired::default(),
            current: NodeAgentsCurrent::default(),
            agents_converge: true,
            target: KubernetesVersion::new(1, 21, 0),
            control_plane,
            workers,
        }
    }

    /// Runs one ensure pass, then lets the node agents report.
    pub async fn tick(&mut self) -> Result<bool> {
        self.tick_with(CancellationToken::new()).await
    }

    pub async fn tick_with(&mut self, cancel: CancellationToken) -> Result<bool> {
        let agents = NodeAgents::new(self.desired.clone(), self.current.clone());
        let members = vec![
            Member {
                tier: Tier::ControlPlane,
                name: "masters".to_string(),
                pool: self.svc.pool("masters"),
                nodes: self.control_plane,
            },
            Member {
                tier: Tier::Workers,
                name: "workers".to_string(),
                pool: self.svc.pool("workers"),
                nodes: self.workers,
            },
        ];
        let ensure = ClusterEnsure::new(
            "k8s",
            self.api.clone(),
            agents.clone(),
            audit(),
            self.target,
            Networking {
                pod_cidr: "100.127.224.0/20".to_string(),
                service_cidr: "100.126.4.0/22".to_string(),
                domain: "cluster.local".to_string(),
            },
            None,
            members,
            self.status.clone(),
        );
        let result = ensure.run(cancel).await;
        self.desired = agents.desired_snapshot();
        if self.agents_converge {
            self.current = report(&self.desired);
        }
        result
    }

    /// Ticks until done, failing after `max` ticks.
    pub async fn converge(&mut self, max: usize) -> usize {
        for n in 1..=max {
            if self.tick().await.unwrap() {
                return n;
            }
        }
        panic!("cluster did not converge within {max} ticks");
    }
}
