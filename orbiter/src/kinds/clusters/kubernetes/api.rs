//! Cluster membership operations, driven through kubeadm and kubectl on a
//! control plane machine.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Context, Error, Result};
use crate::infra::Machine;

const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBEADM_CONF: &str = "/etc/kubeadm/config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    ControlPlane,
    Workers,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::ControlPlane => f.write_str("controlplane"),
            Tier::Workers => f.write_str("workers"),
        }
    }
}

/// A registered cluster node. Node names are machine ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub ready: bool,
    pub cordoned: bool,
}

/// Parameters for initialising and joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitConfig {
    pub cluster: String,
    pub version: String,
    /// `host:port` of the API server as reached by nodes.
    pub endpoint: String,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub domain: String,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Registered nodes as seen from `via`, or `None` if `via` is not an
    /// initialised control plane member.
    async fn nodes(&self, via: &dyn Machine) -> Result<Option<Vec<Node>>>;

    async fn init(&self, first: &dyn Machine, cfg: &InitConfig) -> Result<()>;

    async fn join(
        &self,
        via: &dyn Machine,
        node: &dyn Machine,
        tier: Tier,
        cfg: &InitConfig,
    ) -> Result<()>;

    async fn drain(&self, via: &dyn Machine, node: &str) -> Result<()>;

    async fn uncordon(&self, via: &dyn Machine, node: &str) -> Result<()>;

    async fn delete_node(&self, via: &dyn Machine, node: &str) -> Result<()>;

    /// Removes every trace of the cluster from `node`.
    async fn reset(&self, node: &dyn Machine) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<NodeItem>,
}

#[derive(Debug, Deserialize)]
struct NodeItem {
    metadata: NodeMeta,
    #[serde(default)]
    spec: NodeSpec,
    #[serde(default)]
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct NodeMeta {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSpec {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

fn parse_nodes(json: &[u8]) -> Result<Vec<Node>> {
    let list: NodeList = serde_json::from_slice(json)
        .map_err(|e| Error::remote(format!("parsing node list: {e}")))?;
    Ok(list
        .items
        .into_iter()
        .map(|item| Node {
            ready: item
                .status
                .conditions
                .iter()
                .any(|c| c.kind == "Ready" && c.status == "True"),
            cordoned: item.spec.unschedulable,
            name: item.metadata.name,
        })
        .collect())
}

fn kubectl(args: &str) -> String {
    format!("sudo kubectl --kubeconfig {ADMIN_CONF} {args}")
}

fn kubeadm_config(first: &dyn Machine, cfg: &InitConfig) -> String {
    format!(
        "apiVersion: kubeadm.k8s.io/v1beta3
kind: InitConfiguration
nodeRegistration:
  name: {name}
localAPIEndpoint:
  advertiseAddress: {ip}
---
apiVersion: kubeadm.k8s.io/v1beta3
kind: ClusterConfiguration
clusterName: {cluster}
kubernetesVersion: {version}
controlPlaneEndpoint: {endpoint}
networking:
  podSubnet: {pods}
  serviceSubnet: {services}
  dnsDomain: {domain}
",
        name = first.id(),
        ip = first.ip(),
        cluster = cfg.cluster,
        version = cfg.version,
        endpoint = cfg.endpoint,
        pods = cfg.pod_cidr,
        services = cfg.service_cidr,
        domain = cfg.domain,
    )
}

/// [`ClusterApi`] running kubeadm and kubectl over the machines' remotes.
#[derive(Debug, Default)]
pub struct KubeadmApi;

#[async_trait]
impl ClusterApi for KubeadmApi {
    async fn nodes(&self, via: &dyn Machine) -> Result<Option<Vec<Node>>> {
        match via.execute(None, &format!("sudo test -f {ADMIN_CONF}")).await {
            Ok(_) => {}
            Err(Error::Command { .. }) => return Ok(None),
            Err(e) => return Err(e),
        }
        let out = via.execute(None, &kubectl("get nodes -o json")).await?;
        let nodes = parse_nodes(&out)?;
        debug!(via = via.id(), nodes = nodes.len(), "Listed nodes");
        Ok(Some(nodes))
    }

    async fn init(&self, first: &dyn Machine, cfg: &InitConfig) -> Result<()> {
        info!(cluster = %cfg.cluster, node = first.id(), "Initialising cluster");
        first
            .write_file(KUBEADM_CONF, kubeadm_config(first, cfg).as_bytes(), 0o600)
            .await?;
        first
            .execute(
                None,
                &format!("sudo kubeadm init --config {KUBEADM_CONF} --upload-certs"),
            )
            .await
            .with_context(|| format!("initialising cluster {} on {}", cfg.cluster, first.id()))?;
        Ok(())
    }

    async fn join(
        &self,
        via: &dyn Machine,
        node: &dyn Machine,
        tier: Tier,
        cfg: &InitConfig,
    ) -> Result<()> {
        let out = via
            .execute(None, "sudo kubeadm token create --print-join-command")
            .await?;
        let join = String::from_utf8_lossy(&out).trim().to_string();
        if !join.starts_with("kubeadm join") {
            return Err(Error::remote(format!(
                "unexpected join command from {}: {join}",
                via.id()
            )));
        }

        let mut cmd = format!("sudo {join} --node-name {}", node.id());
        if tier == Tier::ControlPlane {
            let out = via
                .execute(None, "sudo kubeadm init phase upload-certs --upload-certs")
                .await?;
            let key = String::from_utf8_lossy(&out)
                .lines()
                .last()
                .unwrap_or_default()
                .trim()
                .to_string();
            cmd.push_str(&format!(
                " --control-plane --certificate-key {key} --apiserver-advertise-address {}",
                node.ip()
            ));
        }

        info!(cluster = %cfg.cluster, node = node.id(), %tier, "Joining node");
        node.execute(None, &cmd)
            .await
            .with_context(|| format!("joining {} to cluster {}", node.id(), cfg.cluster))?;
        Ok(())
    }

    async fn drain(&self, via: &dyn Machine, node: &str) -> Result<()> {
        via.execute(
            None,
            &kubectl(&format!(
                "drain {node} --ignore-daemonsets --delete-emptydir-data --timeout=300s"
            )),
        )
        .await
        .with_context(|| format!("draining node {node}"))
        .map(|_| ())
    }

    async fn uncordon(&self, via: &dyn Machine, node: &str) -> Result<()> {
        via.execute(None, &kubectl(&format!("uncordon {node}")))
            .await
            .with_context(|| format!("uncordoning node {node}"))
            .map(|_| ())
    }

    async fn delete_node(&self, via: &dyn Machine, node: &str) -> Result<()> {
        via.execute(
            None,
            &kubectl(&format!("delete node {node} --ignore-not-found")),
        )
        .await
        .with_context(|| format!("deleting node {node}"))
        .map(|_| ())
    }

    async fn reset(&self, node: &dyn Machine) -> Result<()> {
        node.execute(None, "sudo kubeadm reset --force && sudo rm -rf /etc/kubeadm")
            .await
            .with_context(|| format!("resetting {}", node.id()))
            .map(|_| ())
    }
}
