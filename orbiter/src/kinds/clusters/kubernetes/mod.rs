//! Kubernetes clusters on machines of provider pools.

pub mod api;
pub mod desired;
pub mod ensure;
pub mod version;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use self::desired::{Desired, PoolRef, Spec};
use self::ensure::{ClusterEnsure, ClusterStatus, Member};
use crate::audit::OrbiterAuditLogger;
use crate::error::{Context, Result};
use crate::fanout::fanout;
use crate::kinds::{
    Adaptation, Adapter, Collaborators, Delegates, EnsureFunc, KindId, OrbConfig, Queried,
};
use crate::nodeagent::NodeAgents;
use crate::tree::{Secrets, Tree};

pub use api::{ClusterApi, InitConfig, KubeadmApi, Node, Tier};
pub use version::KubernetesVersion;

/// Ingress name of the API server on the control plane's provider.
pub const KUBEAPI_INGRESS: &str = "kubeapi";

#[derive(Serialize)]
struct Current<'a> {
    current: &'a ClusterStatus,
}

pub struct KubernetesCluster {
    id: String,
    spec: Spec,
    target: KubernetesVersion,
    api: Arc<dyn ClusterApi>,
    audit: Arc<OrbiterAuditLogger>,
    status: Arc<Mutex<ClusterStatus>>,
}

pub fn adapt(id: &str, tree: Tree, collab: &Collaborators) -> Result<Adaptation> {
    let (Desired { spec }, migrated) =
        desired::parse(tree).with_context(|| format!("parsing cluster {id}"))?;
    let target = spec.version()?;
    Ok(Adaptation {
        adapter: Arc::new(KubernetesCluster {
            id: id.to_string(),
            spec,
            target,
            api: collab.cluster_api.clone(),
            audit: collab.audit.clone(),
            status: Arc::new(Mutex::new(ClusterStatus::default())),
        }),
        migrated,
        secrets: Secrets::new(),
    })
}

impl KubernetesCluster {
    fn tiers(&self) -> impl Iterator<Item = (Tier, &PoolRef)> {
        std::iter::once((Tier::ControlPlane, &self.spec.control_plane))
            .chain(self.spec.workers.iter().map(|w| (Tier::Workers, w)))
    }

    fn members(&self, delegates: &Delegates) -> Result<Vec<Member>> {
        self.tiers()
            .map(|(tier, r)| {
                Ok(Member {
                    tier,
                    name: r.pool.clone(),
                    pool: delegates
                        .pool(&r.provider, &r.pool)
                        .with_context(|| format!("resolving pools of cluster {}", self.id))?,
                    nodes: r.nodes,
                })
            })
            .collect()
    }
}

#[async_trait]
impl Adapter for KubernetesCluster {
    fn verbose(&self) -> bool {
        self.spec.verbose
    }

    async fn query(&self, agents: &NodeAgents, delegates: &Delegates) -> Result<Queried> {
        let members = self.members(delegates)?;
        let endpoint = delegates
            .ingress(&self.spec.control_plane.provider, KUBEAPI_INGRESS)
            .cloned();
        let ensure = ClusterEnsure::new(
            &self.id,
            self.api.clone(),
            agents.clone(),
            self.audit.clone(),
            self.target,
            self.spec.networking.clone(),
            endpoint,
            members,
            self.status.clone(),
        );
        Ok(Queried::new(EnsureFunc::new(move |cancel| ensure.run(cancel))))
    }

    async fn destroy(&self, _agents: &NodeAgents, delegates: &Delegates) -> Result<()> {
        let mut tasks = Vec::new();
        for member in self.members(delegates)? {
            for machine in member.pool.machines().await? {
                let api = self.api.clone();
                tasks.push(async move { api.reset(machine.as_ref()).await });
            }
        }
        let reset = fanout(tasks)
            .await
            .with_context(|| format!("destroying cluster {}", self.id))?
            .len();
        *self.status.lock().expect("cluster status poisoned") = ClusterStatus::default();
        info!(cluster = %self.id, reset, "Cluster destroyed");
        Ok(())
    }

    async fn configure(&self, _orb: &OrbConfig) -> Result<()> {
        Ok(())
    }

    fn desired(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::KubernetesCluster.common(),
            &Desired {
                spec: self.spec.clone(),
            },
        )
    }

    fn current(&self) -> Result<Tree> {
        let status = self.status.lock().expect("cluster status poisoned");
        Tree::encode(
            &KindId::KubernetesCluster.common(),
            &Current { current: &*status },
        )
    }
}
