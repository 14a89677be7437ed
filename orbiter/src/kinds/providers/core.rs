//! Provider behaviour shared by every machines service.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audit::OrbiterAuditLogger;
use crate::error::{Context, Error, Result};
use crate::fanout::{fanout, fanout_done};
use crate::infra::{Machines, MachinesService, Pool, ServicePool};
use crate::kinds::{Adapter, Delegates, EnsureFunc, ProviderCurrent};
use crate::nodeagent::{NodeAgentInstaller, NodeAgents, ensure_node_agent};

/// Pools of one provider plus the load balancer in front of them.
pub struct ProviderCore {
    id: String,
    svc: Arc<dyn MachinesService>,
    lb: Option<Arc<dyn Adapter>>,
    audit: Arc<OrbiterAuditLogger>,
}

impl ProviderCore {
    pub fn new(
        id: &str,
        svc: Arc<dyn MachinesService>,
        lb: Option<Arc<dyn Adapter>>,
        audit: Arc<OrbiterAuditLogger>,
    ) -> Self {
        Self {
            id: id.to_string(),
            svc,
            lb,
            audit,
        }
    }

    pub fn load_balancer(&self) -> Option<&Arc<dyn Adapter>> {
        self.lb.as_ref()
    }

    /// Builds the pools. With `agents`, pools carry the load balancer's member check.
    pub async fn pools(&self, agents: Option<&NodeAgents>) -> Result<BTreeMap<String, Arc<dyn Pool>>> {
        let names = self
            .svc
            .list_pools()
            .await
            .with_context(|| format!("listing pools of provider {}", self.id))?;
        let check = match (agents, &self.lb) {
            (Some(agents), Some(lb)) => lb.members_check(agents),
            _ => None,
        };
        Ok(names
            .into_iter()
            .map(|name| {
                let mut pool = ServicePool::new(name.clone(), self.svc.clone());
                if let Some(check) = &check {
                    pool = pool.with_members_check(check.clone());
                }
                (name, Arc::new(pool) as Arc<dyn Pool>)
            })
            .collect())
    }

    fn own(&self, pools: &BTreeMap<String, Arc<dyn Pool>>) -> Delegates {
        Delegates::with_provider(
            &self.id,
            ProviderCurrent {
                pools: pools.clone(),
                ingresses: BTreeMap::new(),
            },
        )
    }

    /// Queries the load balancer over this provider's pools.
    pub async fn query(&self, agents: &NodeAgents) -> Result<(ProviderCurrent, EnsureFunc)> {
        let pools = self.pools(Some(agents)).await?;
        let (ingresses, ensure) = match &self.lb {
            Some(lb) => {
                let queried = lb
                    .query(agents, &self.own(&pools))
                    .await
                    .with_context(|| format!("querying load balancer of provider {}", self.id))?;
                let ingresses = queried.provides.map(|p| p.ingresses).unwrap_or_default();
                (ingresses, queried.ensure)
            }
            None => (BTreeMap::new(), EnsureFunc::done()),
        };
        Ok((ProviderCurrent { pools, ingresses }, ensure))
    }

    /// Destroys the load balancer, then every machine of every pool.
    ///
    /// Pools are left alone if the load balancer fails or still references them.
    pub async fn destroy(
        &self,
        agents: &NodeAgents,
        node_agent: Option<Arc<dyn NodeAgentInstaller>>,
    ) -> Result<()> {
        let pools = self.pools(None).await?;
        if let Some(lb) = &self.lb {
            lb.destroy(agents, &self.own(&pools))
                .await
                .with_context(|| format!("destroying load balancer of provider {}", self.id))?;
            let refs = lb.references();
            if !refs.is_empty() {
                return Err(Error::DestroyOrder {
                    resource: format!(
                        "pools {} of provider {}",
                        refs.into_iter().collect::<Vec<_>>().join(", "),
                        self.id
                    ),
                    referenced_by: "load balancer".to_string(),
                });
            }
        }

        let mut tasks = Vec::new();
        for (name, pool) in pools {
            for machine in pool.machines().await? {
                let agents = agents.clone();
                let audit = self.audit.clone();
                let node_agent = node_agent.clone();
                let name = name.clone();
                tasks.push(async move {
                    if let Some(installer) = node_agent {
                        installer.uninstall(machine.as_ref()).await?;
                    }
                    machine
                        .remove()
                        .await
                        .with_context(|| format!("removing machine {}", machine.id()))?;
                    agents.remove(machine.id());
                    audit.machine_removed(&name, machine.id());
                    Ok::<_, Error>(())
                });
            }
        }
        let removed = fanout(tasks).await?.len();
        info!(provider = %self.id, removed, "Provider destroyed");
        Ok(())
    }
}

/// Lists the machines of all pools concurrently.
pub async fn list_all(pools: &BTreeMap<String, Arc<dyn Pool>>) -> Result<BTreeMap<String, Machines>> {
    let tasks = pools.iter().map(|(name, pool)| {
        let name = name.clone();
        let pool = pool.clone();
        async move {
            let machines = pool.machines().await?;
            Ok::<_, Error>((name, machines))
        }
    });
    Ok(fanout(tasks).await?.into_iter().collect())
}

/// Ensures the node agent runs at `commit` on every machine.
pub async fn ensure_node_agents(
    machines: &BTreeMap<String, Machines>,
    installer: Arc<dyn NodeAgentInstaller>,
    commit: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    crate::kinds::checkpoint(cancel)?;
    let tasks = machines.values().flatten().map(|machine| {
        let machine = machine.clone();
        let installer = installer.clone();
        let commit = commit.to_string();
        async move {
            ensure_node_agent(installer.as_ref(), machine.as_ref(), &commit)
                .await
                .with_context(|| format!("ensuring node agent on {}", machine.id()))
        }
    });
    let done = fanout_done(tasks).await?;
    if !done {
        debug!("Node agents are being installed");
    }
    Ok(done)
}
