//! Load balancing on the provider's own machines with keepalived and nginx.
//!
//! Every machine of a hosting pool runs keepalived for the pool's virtual IPs
//! and an nginx stream proxy forwarding each transport to the machines of its
//! backend pools. Both are rendered into the node agent desired records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info};

use crate::audit::{LogLevel, OrbiterAuditLogger};
use crate::error::{Context, Error, Result};
use crate::fanout::fanout;
use super::Interfaces;
use crate::infra::{Machines, MembersCheck};
use crate::kinds::{
    Adaptation, Adapter, Address, Collaborators, Delegates, EnsureFunc, KindId, OrbConfig,
    ProviderCurrent, Queried, upgrade,
};
use crate::nodeagent::{Firewall, NodeAgents, Package, Port, Software};
use crate::tree::{Secrets, Tree, backfill};

const KEEPALIVED_CONF: &str = "keepalived.conf";
const NGINX_CONF: &str = "nginx.conf";

/// A transport forwarded from a virtual IP to backend pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transport {
    pub name: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub backend_pools: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vip {
    pub ip: String,
    /// Defaults to the provider's private interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default)]
    pub transport: Vec<Transport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Desired {
    /// Hosting pool to the virtual IPs it serves.
    #[serde(default)]
    spec: BTreeMap<String, Vec<Vip>>,
}

#[derive(Debug, Serialize)]
struct Current<'a> {
    current: CurrentBody<'a>,
}

#[derive(Debug, Serialize)]
struct CurrentBody<'a> {
    ingresses: &'a BTreeMap<String, Address>,
}

#[derive(Debug, Default)]
struct State {
    /// Hosting pool to machine ids, in rendering order.
    hosts: BTreeMap<String, Vec<String>>,
    /// Backend pool to sorted machine IPs.
    backends: BTreeMap<String, Vec<String>>,
    ingresses: BTreeMap<String, Address>,
    destroyed: bool,
}

struct Inner {
    provider: String,
    interfaces: Interfaces,
    spec: BTreeMap<String, Vec<Vip>>,
    state: Mutex<State>,
    audit: Arc<OrbiterAuditLogger>,
}

pub struct DynamicLoadBalancer {
    inner: Arc<Inner>,
}

pub fn adapt(
    provider: &str,
    interfaces: &Interfaces,
    mut tree: Tree,
    collab: &Collaborators,
) -> Result<Adaptation> {
    let mut migrated = upgrade(KindId::DynamicLoadBalancer, &mut tree, |_, _| Ok(()))?;
    migrated |= backfill_whitelists(&mut tree.value);

    let desired: Desired = tree.decode()?;
    validate(&desired.spec)?;
    if interfaces.private.is_empty()
        && desired.spec.values().flatten().any(|vip| vip.interface.is_none())
    {
        return Err(Error::validation(format!(
            "provider {provider} has no private interface for its virtual IPs"
        )));
    }

    Ok(Adaptation {
        adapter: Arc::new(DynamicLoadBalancer {
            inner: Arc::new(Inner {
                provider: provider.to_string(),
                interfaces: interfaces.clone(),
                spec: desired.spec,
                state: Mutex::new(State::default()),
                audit: collab.audit.clone(),
            }),
        }),
        migrated,
        secrets: Secrets::new(),
    })
}

/// Transports written before whitelists existed accept every source.
fn backfill_whitelists(value: &mut Value) -> bool {
    let Some(Value::Mapping(pools)) = value.get_mut("spec") else {
        return false;
    };
    let mut changed = false;
    for (_, vips) in pools.iter_mut() {
        let Value::Sequence(vips) = vips else {
            continue;
        };
        for vip in vips {
            let Some(Value::Sequence(transports)) = vip.get_mut("transport") else {
                continue;
            };
            for transport in transports {
                changed |= backfill(
                    transport,
                    &["whitelist"],
                    Value::Sequence(vec!["0.0.0.0/0".into()]),
                );
            }
        }
    }
    changed
}

fn validate(spec: &BTreeMap<String, Vec<Vip>>) -> Result<()> {
    let mut names = BTreeSet::new();
    for (pool, vips) in spec {
        for vip in vips {
            if vip.ip.is_empty() {
                return Err(Error::validation(format!(
                    "virtual IP of pool {pool} has no address"
                )));
            }
            for t in &vip.transport {
                if !names.insert(t.name.as_str()) {
                    return Err(Error::validation(format!(
                        "transport {} is defined more than once",
                        t.name
                    )));
                }
                if t.frontend_port == 0 || t.backend_port == 0 {
                    return Err(Error::validation(format!(
                        "transport {} needs frontend and backend ports",
                        t.name
                    )));
                }
                if t.backend_pools.is_empty() {
                    return Err(Error::validation(format!(
                        "transport {} has no backend pools",
                        t.name
                    )));
                }
                if let Some(bad) = t.whitelist.iter().find(|c| !c.contains('/')) {
                    return Err(Error::validation(format!(
                        "whitelist entry {bad} of transport {} is not a CIDR",
                        t.name
                    )));
                }
            }
        }
    }
    Ok(())
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("load balancer state poisoned")
    }

    fn backend_pools(&self) -> BTreeSet<String> {
        self.spec
            .values()
            .flatten()
            .flat_map(|vip| vip.transport.iter())
            .flat_map(|t| t.backend_pools.iter().cloned())
            .collect()
    }

    fn ingresses(&self) -> BTreeMap<String, Address> {
        self.spec
            .values()
            .flatten()
            .flat_map(|vip| {
                vip.transport.iter().map(|t| {
                    (
                        t.name.clone(),
                        Address {
                            location: vip.ip.clone(),
                            frontend_port: t.frontend_port,
                            backend_port: t.backend_port,
                        },
                    )
                })
            })
            .collect()
    }

    /// Writes keepalived and nginx configuration of every hosting machine.
    fn render(&self, agents: &NodeAgents, state: &State) {
        for (pool, ids) in &state.hosts {
            let vips = self.spec.get(pool).map(Vec::as_slice).unwrap_or_default();
            let mut firewall = Firewall::default();
            for t in vips.iter().flat_map(|v| v.transport.iter()) {
                firewall
                    .0
                    .insert(t.name.clone(), Port::tcp(t.frontend_port.to_string()));
            }
            for (idx, id) in ids.iter().enumerate() {
                let software = Software {
                    keepalived: Package::default().with_config(
                        KEEPALIVED_CONF,
                        keepalived_config(vips, &self.interfaces, idx),
                    ),
                    nginx: Package::default()
                        .with_config(NGINX_CONF, nginx_config(vips, &state.backends)),
                    ..Default::default()
                };
                agents.update(id, |spec| {
                    spec.software.overwrite(&software);
                    spec.firewall.merge(&firewall);
                });
            }
        }
    }
}

fn keepalived_config(vips: &[Vip], interfaces: &Interfaces, machine_idx: usize) -> String {
    let mut out = String::new();
    for (idx, vip) in vips.iter().enumerate() {
        let priority = 150usize.saturating_sub(machine_idx).max(1);
        let interface = vip.interface.as_deref().unwrap_or(&interfaces.private);
        let _ = writeln!(out, "vrrp_instance VI_{idx} {{");
        let _ = writeln!(out, "    state BACKUP");
        let _ = writeln!(out, "    interface {interface}");
        let _ = writeln!(out, "    virtual_router_id {}", 50 + idx);
        let _ = writeln!(out, "    priority {priority}");
        let _ = writeln!(out, "    advert_int 1");
        let _ = writeln!(out, "    virtual_ipaddress {{");
        let _ = writeln!(out, "        {}", vip.ip);
        let _ = writeln!(out, "    }}");
        if !interfaces.external.is_empty() {
            let _ = writeln!(out, "    track_interface {{");
            for external in &interfaces.external {
                let _ = writeln!(out, "        {external}");
            }
            let _ = writeln!(out, "    }}");
        }
        let _ = writeln!(out, "}}");
    }
    out
}

fn nginx_config(vips: &[Vip], backends: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::from("events {}\n\nstream {\n");
    for vip in vips {
        for t in &vip.transport {
            let _ = writeln!(out, "    upstream {} {{", t.name);
            for ip in t
                .backend_pools
                .iter()
                .flat_map(|p| backends.get(p).into_iter().flatten())
            {
                let _ = writeln!(out, "        server {ip}:{};", t.backend_port);
            }
            let _ = writeln!(out, "    }}");
            let _ = writeln!(out, "    server {{");
            let _ = writeln!(out, "        listen {}:{};", vip.ip, t.frontend_port);
            for cidr in &t.whitelist {
                let _ = writeln!(out, "        allow {cidr};");
            }
            let _ = writeln!(out, "        deny all;");
            let _ = writeln!(out, "        proxy_pass {};", t.name);
            let _ = writeln!(out, "    }}");
        }
    }
    out.push_str("}\n");
    out
}

fn sorted_ips(machines: &Machines) -> Vec<String> {
    let mut ips: Vec<String> = machines.iter().map(|m| m.ip().to_string()).collect();
    ips.sort();
    ips
}

async fn list_pools(
    delegates: &Delegates,
    provider: &str,
    pools: impl IntoIterator<Item = String>,
) -> Result<BTreeMap<String, Machines>> {
    let mut tasks = Vec::new();
    for name in pools {
        let pool = delegates.pool(provider, &name)?;
        tasks.push(async move {
            let machines = pool.machines().await?;
            Ok::<_, Error>((name, machines))
        });
    }
    Ok(fanout(tasks).await?.into_iter().collect())
}

#[async_trait]
impl Adapter for DynamicLoadBalancer {
    async fn query(&self, agents: &NodeAgents, delegates: &Delegates) -> Result<Queried> {
        let inner = &self.inner;
        let hosts = list_pools(delegates, &inner.provider, inner.spec.keys().cloned())
            .await
            .context("listing load balancing machines")?;
        let backends = list_pools(delegates, &inner.provider, inner.backend_pools())
            .await
            .context("listing backend machines")?;

        let ingresses = inner.ingresses();
        let host_ids: Vec<String> = {
            let mut state = inner.lock();
            state.hosts = hosts
                .iter()
                .map(|(pool, ms)| (pool.clone(), ms.iter().map(|m| m.id().to_string()).collect()))
                .collect();
            state.backends = backends
                .iter()
                .map(|(pool, ms)| (pool.clone(), sorted_ips(ms)))
                .collect();
            state.ingresses = ingresses.clone();
            inner.render(agents, &state);
            state.hosts.values().flatten().cloned().collect()
        };
        debug!(
            provider = %inner.provider,
            hosts = host_ids.len(),
            ingresses = ingresses.len(),
            "Rendered load balancing"
        );

        let agents = agents.clone();
        Ok(Queried {
            ensure: EnsureFunc::new(move |_| async move {
                let pending: Vec<&String> =
                    host_ids.iter().filter(|id| !agents.converged(id)).collect();
                if !pending.is_empty() {
                    debug!(?pending, "Load balancing not yet applied");
                }
                Ok(pending.is_empty())
            }),
            provides: Some(ProviderCurrent {
                pools: BTreeMap::new(),
                ingresses,
            }),
        })
    }

    async fn destroy(&self, agents: &NodeAgents, delegates: &Delegates) -> Result<()> {
        let inner = &self.inner;
        let hosts = list_pools(delegates, &inner.provider, inner.spec.keys().cloned())
            .await
            .context("listing load balancing machines")?;
        let removed = Software {
            keepalived: Package::removed(),
            nginx: Package::removed(),
            ..Default::default()
        };
        for machine in hosts.values().flatten() {
            agents.update(machine.id(), |spec| spec.software.overwrite(&removed));
        }

        let mut state = inner.lock();
        *state = State {
            destroyed: true,
            ..Default::default()
        };
        info!(provider = %inner.provider, "Load balancing removed");
        inner
            .audit
            .log(LogLevel::Audit, "Load balancing removed", &[&inner.provider]);
        Ok(())
    }

    async fn configure(&self, _orb: &OrbConfig) -> Result<()> {
        Ok(())
    }

    fn desired(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::DynamicLoadBalancer.common(),
            &Desired {
                spec: self.inner.spec.clone(),
            },
        )
    }

    fn current(&self) -> Result<Tree> {
        let state = self.inner.lock();
        Tree::encode(
            &KindId::DynamicLoadBalancer.common(),
            &Current {
                current: CurrentBody {
                    ingresses: &state.ingresses,
                },
            },
        )
    }

    fn references(&self) -> BTreeSet<String> {
        if self.inner.lock().destroyed {
            return BTreeSet::new();
        }
        let mut refs = self.inner.backend_pools();
        refs.extend(self.inner.spec.keys().cloned());
        refs
    }

    fn members_check(&self, agents: &NodeAgents) -> Option<Arc<dyn MembersCheck>> {
        Some(Arc::new(BackendMembers {
            inner: self.inner.clone(),
            agents: agents.clone(),
        }))
    }
}

/// Re-renders the proxies when a backend pool's members changed since query.
struct BackendMembers {
    inner: Arc<Inner>,
    agents: NodeAgents,
}

#[async_trait]
impl MembersCheck for BackendMembers {
    async fn ensure(&self, pool: &str, machines: &Machines) -> Result<bool> {
        let mut state = self.inner.lock();
        if state.destroyed {
            return Ok(true);
        }
        let Some(known) = state.backends.get(pool) else {
            return Ok(true);
        };
        let ips = sorted_ips(machines);
        if *known == ips {
            return Ok(true);
        }
        info!(pool, members = ips.len(), "Backend members changed, updating proxies");
        state.backends.insert(pool.to_string(), ips);
        self.inner.render(&self.agents, &state);
        Ok(false)
    }
}
