//! Provider over statically enumerated hosts reached via SSH.

pub mod desired;
pub mod service;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use self::desired::{Desired, Keys, Spec};
use self::service::StaticMachinesService;
use crate::audit::OrbiterAuditLogger;
use crate::error::{Context, Error, Result};
use crate::infra::{MachinesService, Requirements, ssh};
use crate::kinds::providers::core::{ProviderCore, ensure_node_agents, list_all};
use crate::kinds::{
    Adaptation, Adapter, Address, Collaborators, Delegates, EnsureFunc, KindId, MachineCommand,
    OrbConfig, ProviderCurrent, Queried, checkpoint, loadbalancers,
};
use crate::nodeagent::{NodeAgentInstaller, NodeAgents};
use crate::tree::{Secret, Secrets, Tree, append_secrets};

#[derive(Debug, Default, Serialize)]
struct Status {
    pools: BTreeMap<String, Vec<String>>,
    ingresses: BTreeMap<String, Address>,
}

#[derive(Serialize)]
struct Current<'a> {
    current: &'a Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    loadbalancing: Option<Tree>,
}

pub struct StaticProvider {
    id: String,
    spec: Spec,
    keys: Arc<Mutex<Keys>>,
    requirements: Arc<Requirements>,
    service: StaticMachinesService,
    core: ProviderCore,
    node_agent: Arc<dyn NodeAgentInstaller>,
    commit: String,
    status: Arc<Mutex<Status>>,
    audit: Arc<OrbiterAuditLogger>,
}

pub fn adapt(id: &str, tree: Tree, collab: &Collaborators) -> Result<Adaptation> {
    let (desired, mut migrated) =
        desired::parse(tree).with_context(|| format!("parsing static provider {id}"))?;
    let Desired {
        spec,
        loadbalancing,
    } = desired;

    let mut secrets = Secrets::new();
    append_secrets("", &mut secrets, spec.keys.secrets());

    let lb = match loadbalancing {
        Some(tree) => {
            let interfaces = loadbalancers::Interfaces {
                private: spec.private_interface.clone(),
                external: spec.external_interfaces.clone(),
            };
            let lb = loadbalancers::adapt(id, &interfaces, tree, collab)
                .with_context(|| format!("parsing load balancing of provider {id}"))?;
            migrated |= lb.migrated;
            append_secrets("loadbalancing", &mut secrets, lb.secrets);
            Some(lb.adapter)
        }
        None => None,
    };

    let requirements = Arc::new(Requirements::new(
        hosts(&spec).filter(|h| h.reboot_required).map(|h| h.id.clone()),
        hosts(&spec)
            .filter(|h| h.replacement_required)
            .map(|h| h.id.clone()),
    ));
    let keys = Arc::new(Mutex::new(spec.keys.clone()));
    let service = StaticMachinesService::new(
        &spec.remote_user,
        spec.pools.clone(),
        keys.clone(),
        collab.connector.clone(),
        requirements.clone(),
    );
    let core = ProviderCore::new(
        id,
        Arc::new(service.clone()),
        lb,
        collab.audit.clone(),
    );

    Ok(Adaptation {
        adapter: Arc::new(StaticProvider {
            id: id.to_string(),
            spec,
            keys,
            requirements,
            service,
            core,
            node_agent: collab.node_agent.clone(),
            commit: collab.commit.clone(),
            status: Arc::new(Mutex::new(Status::default())),
            audit: collab.audit.clone(),
        }),
        migrated,
        secrets,
    })
}

fn hosts(spec: &Spec) -> impl Iterator<Item = &desired::Host> {
    spec.pools.values().flatten()
}

impl StaticProvider {
    fn keys(&self) -> Keys {
        self.keys.lock().expect("keys lock poisoned").clone()
    }
}

#[async_trait]
impl Adapter for StaticProvider {
    async fn query(&self, agents: &NodeAgents, _delegates: &Delegates) -> Result<Queried> {
        if self.keys().private().is_empty() {
            return Err(Error::validation(format!(
                "provider {} has no ssh keys, run configure first",
                self.id
            )));
        }

        let (provides, lb_ensure) = self.core.query(agents).await?;
        self.status.lock().expect("status lock poisoned").ingresses = provides.ingresses.clone();

        let pools = provides.pools.clone();
        let installer = self.node_agent.clone();
        let commit = self.commit.clone();
        let status = self.status.clone();
        let ensure = EnsureFunc::new(move |cancel| async move {
            let machines = list_all(&pools).await?;
            status.lock().expect("status lock poisoned").pools = machines
                .iter()
                .map(|(pool, ms)| (pool.clone(), ms.iter().map(|m| m.id().to_string()).collect()))
                .collect();

            let agents_done = ensure_node_agents(&machines, installer, &commit, &cancel).await?;
            checkpoint(&cancel)?;
            let lb_done = lb_ensure.run(cancel).await?;
            Ok(agents_done && lb_done)
        });

        Ok(Queried {
            ensure,
            provides: Some(provides),
        })
    }

    async fn destroy(&self, agents: &NodeAgents, _delegates: &Delegates) -> Result<()> {
        self.core
            .destroy(agents, Some(self.node_agent.clone()))
            .await
            .with_context(|| format!("destroying static provider {}", self.id))
    }

    async fn configure(&self, orb: &OrbConfig) -> Result<()> {
        if self.keys().has_maintenance() {
            return self
                .service
                .distribute_key()
                .await
                .with_context(|| format!("configuring static provider {}", self.id));
        }
        if self.keys().bootstrap_key_private.is_empty() {
            warn!(provider = %self.id, "No bootstrap key, hosts may be unreachable");
        }
        let (private, public) = ssh::generate_keypair().await?;
        {
            let mut keys = self.keys.lock().expect("keys lock poisoned");
            keys.maintenance_key_private = Secret::new(private);
            keys.maintenance_key_public = Secret::new(public);
        }
        info!(provider = %self.id, orb = %orb.orb_id, "Generated maintenance key pair");
        Ok(())
    }

    async fn delegate(&self) -> Result<Option<ProviderCurrent>> {
        Ok(Some(ProviderCurrent {
            pools: self.core.pools(None).await?,
            ingresses: BTreeMap::new(),
        }))
    }

    fn desired(&self) -> Result<Tree> {
        let mut spec = self.spec.clone();
        spec.keys = self.keys();
        for host in spec.pools.values_mut().flatten() {
            host.reboot_required = self.requirements.reboot_required(&host.id);
            host.replacement_required = self.requirements.replacement_required(&host.id);
        }
        let loadbalancing = self
            .core
            .load_balancer()
            .map(|lb| lb.desired())
            .transpose()?;
        Tree::encode(
            &KindId::StaticProvider.common(),
            &Desired {
                spec,
                loadbalancing,
            },
        )
    }

    fn current(&self) -> Result<Tree> {
        let status = self.status.lock().expect("status lock poisoned");
        let loadbalancing = self
            .core
            .load_balancer()
            .map(|lb| lb.current())
            .transpose()?;
        Tree::encode(
            &KindId::StaticProvider.common(),
            &Current {
                current: &*status,
                loadbalancing,
            },
        )
    }

    fn verbose(&self) -> bool {
        self.spec.verbose
    }

    fn command(&self, cmd: &MachineCommand) -> Result<bool> {
        let machine = cmd.command.machine_id();
        let known = self
            .spec
            .pools
            .get(&cmd.pool)
            .ok_or_else(|| {
                Error::validation(format!("provider {} has no pool {}", self.id, cmd.pool))
            })?
            .iter()
            .any(|h| h.id == machine);
        if !known {
            return Err(Error::validation(format!(
                "pool {} of provider {} has no machine {machine}",
                cmd.pool, self.id
            )));
        }
        let changed = self.service.requirements().apply(&cmd.command);
        if changed {
            self.audit
                .requirement_changed(machine, cmd.command.describe());
        }
        Ok(changed)
    }
}
