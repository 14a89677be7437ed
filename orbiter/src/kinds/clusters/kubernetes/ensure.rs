//! Machine pool alignment for one Kubernetes cluster.
//!
//! Phases run in order and the pass stops at the first phase that is not done:
//!
//! 1. desire firewall
//! 2. scale down
//! 3. maintain (replacements, reboots)
//! 4. align (scale up, rolled back on partial failure)
//! 5. merge target software
//! 6. ensure software
//! 7. ensure nodes
//! 8. ensure pool invariants

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{ClusterApi, InitConfig, Node, Tier};
use super::desired::Networking;
use super::version::KubernetesVersion;
use crate::audit::OrbiterAuditLogger;
use crate::error::{Context, Error, Result, concat};
use crate::fanout::{fanout, settle};
use crate::infra::{Machine, Machines, Pool, RequirementCommand, select_for_removal};
use crate::kinds::{Address, checkpoint};
use crate::nodeagent::{Firewall, NodeAgents, Port};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    #[default]
    Unknown,
    ScalingDown,
    Maintaining,
    Creating,
    Upgrading,
    Joining,
    Running,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub tier: Option<Tier>,
    pub pool: String,
    pub joined: bool,
    pub kubernetes: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStatus {
    pub status: Phase,
    pub machines: BTreeMap<String, MachineStatus>,
}

/// One tier's pool with its desired node count.
pub struct Member {
    pub tier: Tier,
    pub name: String,
    pub pool: Arc<dyn Pool>,
    pub nodes: usize,
}

/// Cluster operations shared with fan-out tasks.
#[derive(Clone)]
struct Ops {
    cluster: String,
    api: Arc<dyn ClusterApi>,
    agents: NodeAgents,
    audit: Arc<OrbiterAuditLogger>,
}

impl Ops {
    /// Drains and deletes `node` if it is registered.
    async fn evict(&self, via: Option<&dyn Machine>, node: &str, joined: bool) -> Result<()> {
        let (Some(via), true) = (via, joined) else {
            return Ok(());
        };
        self.api.drain(via, node).await?;
        self.api.delete_node(via, node).await?;
        self.audit.node_deleted(&self.cluster, node);
        Ok(())
    }

    /// Takes a machine out of the cluster and its pool.
    async fn retire(
        self,
        via: Option<Arc<dyn Machine>>,
        joined: bool,
        pool: String,
        machine: Arc<dyn Machine>,
    ) -> Result<()> {
        self.evict(via.as_deref(), machine.id(), joined).await?;
        machine
            .remove()
            .await
            .with_context(|| format!("removing machine {}", machine.id()))?;
        self.agents.remove(machine.id());
        self.audit.machine_removed(&pool, machine.id());
        Ok(())
    }
}

/// Cluster membership as seen from a control plane machine.
#[derive(Default)]
struct Observed {
    via: Option<Arc<dyn Machine>>,
    nodes: BTreeMap<String, Node>,
}

impl Observed {
    fn joined(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }
}

pub struct ClusterEnsure {
    ops: Ops,
    target: KubernetesVersion,
    networking: Networking,
    endpoint: Option<Address>,
    /// Control plane first.
    members: Vec<Member>,
    status: Arc<Mutex<ClusterStatus>>,
}

fn firewall(tier: Tier) -> Firewall {
    let ports: &[(&str, &str)] = match tier {
        Tier::ControlPlane => &[
            ("kubeapi", "6443"),
            ("etcd", "2379-2380"),
            ("kubelet", "10250"),
            ("scheduler", "10259"),
            ("controller", "10257"),
        ],
        Tier::Workers => &[("kubelet", "10250"), ("nodeports", "30000-32767")],
    };
    Firewall(
        ports
            .iter()
            .map(|(name, port)| (name.to_string(), Port::tcp(*port)))
            .collect(),
    )
}

impl ClusterEnsure {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cluster: &str,
        api: Arc<dyn ClusterApi>,
        agents: NodeAgents,
        audit: Arc<OrbiterAuditLogger>,
        target: KubernetesVersion,
        networking: Networking,
        endpoint: Option<Address>,
        members: Vec<Member>,
        status: Arc<Mutex<ClusterStatus>>,
    ) -> Self {
        Self {
            ops: Ops {
                cluster: cluster.to_string(),
                api,
                agents,
                audit,
            },
            target,
            networking,
            endpoint,
            members,
            status,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<bool> {
        let (phase, result) = match self.phases(&cancel).await {
            Ok((phase, done)) => (phase, Ok(done)),
            Err(e) => (Phase::Unknown, Err(e)),
        };
        if phase != Phase::Unknown {
            self.lock_status().status = phase;
        }
        debug!(cluster = %self.ops.cluster, ?phase, "Cluster pass finished");
        result
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, ClusterStatus> {
        self.status.lock().expect("cluster status poisoned")
    }

    async fn phases(&self, cancel: &CancellationToken) -> Result<(Phase, bool)> {
        let machines = self.list().await?;
        for (member, ms) in self.members.iter().zip(&machines) {
            self.desire_firewall(member.tier, ms);
        }
        checkpoint(cancel)?;

        let observed = self.observe(&machines).await?;
        self.record(&machines, &observed);

        // A phase cancelled midway reports the cancellation, not its progress.
        let done = self.scale_down(&machines, &observed).await?;
        checkpoint(cancel)?;
        if !done {
            return Ok((Phase::ScalingDown, false));
        }

        let done = self.maintain(&machines, &observed).await?;
        checkpoint(cancel)?;
        if !done {
            return Ok((Phase::Maintaining, false));
        }

        let done = self.align(&machines).await?;
        checkpoint(cancel)?;
        if !done {
            return Ok((Phase::Creating, false));
        }

        let done = self.ensure_software(&machines, &observed).await?;
        checkpoint(cancel)?;
        if !done {
            return Ok((Phase::Upgrading, false));
        }

        let done = self.ensure_nodes(&machines, &observed).await?;
        checkpoint(cancel)?;
        if !done {
            return Ok((Phase::Joining, false));
        }

        if !self.ensure_members().await? {
            return Ok((Phase::Joining, false));
        }
        Ok((Phase::Running, true))
    }

    async fn list(&self) -> Result<Vec<Machines>> {
        let tasks = self.members.iter().map(|m| {
            let pool = m.pool.clone();
            let name = m.name.clone();
            async move {
                let mut machines = pool
                    .machines()
                    .await
                    .with_context(|| format!("listing pool {name}"))?;
                machines.sort_by(|a, b| a.id().cmp(b.id()));
                Ok::<_, Error>(machines)
            }
        });
        fanout(tasks).await
    }

    fn desire_firewall(&self, tier: Tier, machines: &[Arc<dyn Machine>]) {
        let fw = firewall(tier);
        for m in machines {
            self.ops.agents.update(m.id(), |spec| spec.firewall.merge(&fw));
        }
    }

    async fn observe(&self, machines: &[Machines]) -> Result<Observed> {
        let mut errs = Vec::new();
        for m in machines.first().into_iter().flatten() {
            match self.ops.api.nodes(m.as_ref()).await {
                Ok(Some(nodes)) => {
                    return Ok(Observed {
                        via: Some(m.clone()),
                        nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(machine = m.id(), error = %e, "Listing nodes failed");
                    errs.push(Some(e));
                }
            }
        }
        match concat(errs) {
            Some(err) => Err(err).context("observing cluster nodes"),
            None => Ok(Observed::default()),
        }
    }

    fn record(&self, machines: &[Machines], observed: &Observed) {
        let mut status = self.lock_status();
        status.machines = self
            .members
            .iter()
            .zip(machines)
            .flat_map(|(member, ms)| {
                ms.iter().map(move |m| {
                    let kubernetes = self
                        .ops
                        .agents
                        .current(m.id())
                        .map(|c| c.software.kubelet.version.clone())
                        .unwrap_or_default();
                    (
                        m.id().to_string(),
                        MachineStatus {
                            tier: Some(member.tier),
                            pool: member.name.clone(),
                            joined: observed.joined(m.id()),
                            kubernetes,
                        },
                    )
                })
            })
            .collect();
    }

    /// Whether the node agent of `id` is still rolling out software.
    fn installing(&self, id: &str) -> bool {
        match (self.ops.agents.desired(id), self.ops.agents.current(id)) {
            (Some(desired), Some(current)) => !current.software.defines(&desired.software),
            _ => false,
        }
    }

    async fn scale_down(&self, machines: &[Machines], observed: &Observed) -> Result<bool> {
        let mut deferred = false;
        let mut tasks = Vec::new();
        for (member, ms) in self.members.iter().zip(machines) {
            let want = member.pool.desired_members(member.nodes);
            if ms.len() <= want {
                continue;
            }
            for machine in select_for_removal(ms, ms.len() - want) {
                if self.installing(machine.id()) {
                    info!(machine = machine.id(), "Deferring removal until installation finished");
                    deferred = true;
                    continue;
                }
                info!(pool = %member.name, machine = machine.id(), "Scaling down");
                tasks.push(self.ops.clone().retire(
                    observed.via.clone(),
                    observed.joined(machine.id()),
                    member.name.clone(),
                    machine,
                ));
            }
        }
        let removed = !tasks.is_empty();
        fanout(tasks).await?;
        Ok(!deferred && !removed)
    }

    async fn maintain(&self, machines: &[Machines], observed: &Observed) -> Result<bool> {
        for (member, ms) in self.members.iter().zip(machines) {
            if let Some(old) = ms.iter().find(|m| m.replacement_required()) {
                self.replace(member, old.clone(), observed).await?;
                return Ok(false);
            }
        }
        for (member, ms) in self.members.iter().zip(machines) {
            for machine in ms.iter().filter(|m| m.reboot_required()) {
                if !self.reboot(member, machine.as_ref(), observed).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn replace(&self, member: &Member, old: Arc<dyn Machine>, observed: &Observed) -> Result<()> {
        let old_id = old.id().to_string();
        info!(pool = %member.name, machine = %old_id, "Replacing machine");
        self.ops
            .clone()
            .retire(
                observed.via.clone(),
                observed.joined(&old_id),
                member.name.clone(),
                old,
            )
            .await?;
        let new = member
            .pool
            .add_machine()
            .await
            .with_context(|| format!("replacing machine {old_id}"))?;
        self.desire_firewall(member.tier, std::slice::from_ref(&new));
        self.ops.audit.machine_replaced(&old_id, new.id());

        let cmd = RequirementCommand::UnrequireReplacement(old_id.clone());
        if member.pool.requirements().apply(&cmd) {
            self.ops.audit.requirement_changed(&old_id, cmd.describe());
        }
        Ok(())
    }

    /// Drives one reboot. Returns whether it completed.
    async fn reboot(&self, member: &Member, machine: &dyn Machine, observed: &Observed) -> Result<bool> {
        let id = machine.id();
        let joined = observed.joined(id);
        let via = observed.via.as_deref();
        let requested = self.ops.agents.desired(id).and_then(|s| s.reboot_requested);

        let Some(requested) = requested else {
            if let (Some(via), true) = (via, joined) {
                self.ops.api.drain(via, id).await?;
            }
            self.ops
                .agents
                .update(id, |spec| spec.reboot_requested = Some(Utc::now()));
            info!(machine = id, "Reboot requested");
            return Ok(false);
        };

        let booted = self.ops.agents.current(id).and_then(|c| c.booted_at);
        if !booted.is_some_and(|at| at > requested) {
            debug!(machine = id, "Waiting for reboot");
            return Ok(false);
        }

        if let (Some(via), true) = (via, joined) {
            self.ops.api.uncordon(via, id).await?;
        }
        self.ops.agents.update(id, |spec| spec.reboot_requested = None);
        let cmd = RequirementCommand::UnrequireReboot(id.to_string());
        if member.pool.requirements().apply(&cmd) {
            self.ops.audit.requirement_changed(id, cmd.describe());
        }
        self.ops.audit.machine_rebooted(id);
        Ok(true)
    }

    async fn align(&self, machines: &[Machines]) -> Result<bool> {
        let mut tasks = Vec::new();
        for (idx, (member, ms)) in self.members.iter().zip(machines).enumerate() {
            let want = member.pool.desired_members(member.nodes);
            for _ in ms.len()..want {
                let pool = member.pool.clone();
                tasks.push(async move {
                    let machine = pool.add_machine().await?;
                    Ok::<_, Error>((idx, machine))
                });
            }
        }
        if tasks.is_empty() {
            return Ok(true);
        }

        let count = tasks.len();
        let (created, err) = settle(tasks).await;
        if let Some(err) = err {
            warn!(created = created.len(), requested = count, "Scale up failed, rolling back");
            let rollback = created.into_iter().map(|(idx, machine)| {
                let ops = self.ops.clone();
                let pool = self.members[idx].name.clone();
                async move {
                    machine
                        .remove()
                        .await
                        .with_context(|| format!("rolling back machine {}", machine.id()))?;
                    ops.agents.remove(machine.id());
                    ops.audit.rollback(&pool, machine.id());
                    Ok::<_, Error>(())
                }
            });
            let err = Error::Context {
                context: format!("scaling up cluster {}", self.ops.cluster),
                source: Box::new(err),
            };
            return match fanout(rollback).await {
                Ok(_) => Err(err),
                Err(rollback_err) => Err(Error::Aggregate(vec![err, rollback_err])),
            };
        }

        for (idx, machine) in &created {
            let member = &self.members[*idx];
            self.desire_firewall(member.tier, std::slice::from_ref(machine));
            self.ops.audit.machine_created(&member.name, machine.id());
        }
        info!(cluster = %self.ops.cluster, created = created.len(), "Scaled up");
        Ok(false)
    }

    /// Rolls the target software out, one machine and one minor version at a time.
    async fn ensure_software(&self, machines: &[Machines], observed: &Observed) -> Result<bool> {
        let target = self.target.define_software();
        let agents = &self.ops.agents;
        let mut waiting = false;
        let mut behind = Vec::new();
        for machine in machines.iter().flatten() {
            let desired = agents.update(machine.id(), |spec| {
                spec.software.merge(&target);
                spec.software.clone()
            });
            match agents.current(machine.id()) {
                Some(current) if current.software.defines(&target) => {}
                Some(current) if current.software.defines(&desired) => {
                    behind.push((machine.clone(), current.software.kubelet.version.clone()));
                }
                _ => waiting = true,
            }
        }
        if waiting {
            debug!(cluster = %self.ops.cluster, "Waiting for software rollout");
            return Ok(false);
        }
        let Some((machine, from)) = behind.into_iter().next() else {
            return Ok(true);
        };

        let id = machine.id();
        let from_version: KubernetesVersion = from
            .parse()
            .with_context(|| format!("reading kubernetes version of {id}"))?;
        let step = from_version.next_toward(&self.target);
        if let (Some(via), true) = (observed.via.as_deref(), observed.joined(id)) {
            self.ops.api.drain(via, id).await?;
        }
        agents.update(id, |spec| spec.software.overwrite(&step.define_software()));
        info!(machine = id, %from_version, %step, "Upgrading");
        self.ops.audit.upgrade_step(id, &from, &step.to_string());
        Ok(false)
    }

    fn init_config(&self, first: &dyn Machine) -> InitConfig {
        InitConfig {
            cluster: self.ops.cluster.clone(),
            version: self.target.to_string(),
            endpoint: self
                .endpoint
                .as_ref()
                .map(Address::to_string)
                .unwrap_or_else(|| format!("{}:6443", first.ip())),
            pod_cidr: self.networking.pod_cidr.clone(),
            service_cidr: self.networking.service_cidr.clone(),
            domain: self.networking.domain.clone(),
        }
    }

    async fn ensure_nodes(&self, machines: &[Machines], observed: &Observed) -> Result<bool> {
        let api = &self.ops.api;
        let Some(control_plane) = machines.first().and_then(|ms| ms.first()) else {
            return Ok(false);
        };
        let Some(via) = observed.via.clone() else {
            let cfg = self.init_config(control_plane.as_ref());
            api.init(control_plane.as_ref(), &cfg).await?;
            self.ops
                .audit
                .cluster_initialized(&self.ops.cluster, control_plane.id());
            return Ok(false);
        };
        let cfg = self.init_config(via.as_ref());
        let mut done = true;

        // Control plane members join one by one.
        for (member, ms) in self.members.iter().zip(machines) {
            if member.tier != Tier::ControlPlane {
                continue;
            }
            for m in ms.iter().filter(|m| !observed.joined(m.id())) {
                api.join(via.as_ref(), m.as_ref(), Tier::ControlPlane, &cfg).await?;
                self.ops.audit.node_joined(&self.ops.cluster, m.id());
                done = false;
            }
        }

        let mut joins = Vec::new();
        for (member, ms) in self.members.iter().zip(machines) {
            if member.tier != Tier::Workers {
                continue;
            }
            for m in ms.iter().filter(|m| !observed.joined(m.id())) {
                let (api, via, m, cfg, ops) =
                    (api.clone(), via.clone(), m.clone(), cfg.clone(), self.ops.clone());
                joins.push(async move {
                    api.join(via.as_ref(), m.as_ref(), Tier::Workers, &cfg).await?;
                    ops.audit.node_joined(&ops.cluster, m.id());
                    Ok::<_, Error>(())
                });
            }
        }
        done &= joins.is_empty();
        fanout(joins).await?;

        let known: BTreeSet<&str> = machines.iter().flatten().map(|m| m.id()).collect();
        for name in observed.nodes.keys().filter(|n| !known.contains(n.as_str())) {
            info!(node = %name, "Deleting orphaned node");
            api.delete_node(via.as_ref(), name).await?;
            self.ops.audit.node_deleted(&self.ops.cluster, name);
            done = false;
        }

        for m in machines.iter().flatten() {
            let Some(node) = observed.nodes.get(m.id()) else {
                continue;
            };
            if node.cordoned && !m.reboot_required() {
                api.uncordon(via.as_ref(), m.id()).await?;
                done = false;
            }
            if !node.ready {
                debug!(node = %node.name, "Node not ready");
                done = false;
            }
        }
        Ok(done)
    }

    async fn ensure_members(&self) -> Result<bool> {
        let tasks = self.members.iter().map(|m| {
            let pool = m.pool.clone();
            async move { pool.ensure_members().await }
        });
        Ok(fanout(tasks).await?.into_iter().all(|done| done))
    }
}
