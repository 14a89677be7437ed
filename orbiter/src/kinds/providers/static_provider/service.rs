//! Machines service over a fixed list of hosts.
//!
//! A host is a pool member while it carries an activation marker. Creating a
//! machine activates the first inactive host of the pool, removing it deletes
//! the marker again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::desired::{Host, Keys};
use crate::error::{Context, Error, Result};
use crate::fanout::fanout;
use crate::infra::ssh::quote;
use crate::infra::{Connector, Machine, Machines, MachinesService, Remote, Requirements};

const ACTIVE_DIR: &str = "/var/orbiter";

fn marker(id: &str) -> String {
    format!("{ACTIVE_DIR}/{id}")
}

fn authorized_keys(user: &str) -> String {
    if user == "root" {
        "/root/.ssh/authorized_keys".to_string()
    } else {
        format!("/home/{user}/.ssh/authorized_keys")
    }
}

#[derive(Clone)]
struct Activation {
    pool: String,
    created_at: Option<DateTime<Utc>>,
    remote: Arc<dyn Remote>,
}

#[derive(Default)]
struct Activations {
    active: BTreeMap<String, Activation>,
    /// Hosts reserved by a create that is still writing to them.
    pending: BTreeSet<String>,
}

struct Inventory {
    user: String,
    pools: BTreeMap<String, Vec<Host>>,
    keys: Arc<StdMutex<Keys>>,
    connector: Arc<dyn Connector>,
    requirements: Arc<Requirements>,
    /// Loaded on first use. Never held across remote writes.
    cache: Mutex<Option<Activations>>,
}

impl Inventory {
    fn private_keys(&self) -> Vec<String> {
        self.keys.lock().expect("keys lock poisoned").private()
    }

    fn public_key(&self) -> String {
        self.keys
            .lock()
            .expect("keys lock poisoned")
            .maintenance_key_public
            .value
            .clone()
    }

    fn connect(&self, host: &Host) -> Result<Arc<dyn Remote>> {
        self.connector
            .connect(&self.user, &host.ip, &self.private_keys())
    }

    async fn load(&self) -> Result<Activations> {
        let mut tasks = Vec::new();
        for (pool, hosts) in &self.pools {
            for host in hosts {
                let remote = self.connect(host)?;
                let pool = pool.clone();
                let id = host.id.clone();
                tasks.push(async move {
                    let activation = match remote.read_file(&marker(&id)).await {
                        Ok(content) => {
                            let created_at = DateTime::parse_from_rfc3339(
                                String::from_utf8_lossy(&content).trim(),
                            )
                            .ok()
                            .map(|t| t.with_timezone(&Utc));
                            Some(Activation {
                                pool,
                                created_at,
                                remote,
                            })
                        }
                        // cat exits 1 on a missing marker, ssh exits 255 on transport failures.
                        Err(Error::Command { status: 1, .. }) => None,
                        Err(Error::Command { status, stderr, .. }) => {
                            return Err(Error::remote(format!(
                                "inspecting host {id}: status {status}: {stderr}"
                            )));
                        }
                        Err(e) => return Err(e).with_context(|| format!("inspecting host {id}")),
                    };
                    Ok((id, activation))
                });
            }
        }
        let active: BTreeMap<_, _> = fanout(tasks)
            .await?
            .into_iter()
            .filter_map(|(id, activation)| activation.map(|a| (id, a)))
            .collect();
        debug!(active = active.len(), "Loaded static inventory");
        Ok(Activations {
            active,
            pending: BTreeSet::new(),
        })
    }

    async fn loaded<'a>(&self, cache: &'a mut Option<Activations>) -> Result<&'a mut Activations> {
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache.get_or_insert_with(Activations::default))
    }

    /// Authorizes the maintenance key on `host` and writes its marker.
    async fn activate(&self, pool: &str, host: &Host) -> Result<Activation> {
        let remote = self.connect(host)?;
        let public = self.public_key();
        if !public.is_empty() {
            remote
                .write_file(
                    &authorized_keys(&self.user),
                    format!("{public}\n").as_bytes(),
                    0o600,
                )
                .await
                .with_context(|| format!("authorizing maintenance key on {}", host.id))?;
        }
        let now = Utc::now();
        remote
            .write_file(&marker(&host.id), now.to_rfc3339().as_bytes(), 0o644)
            .await
            .with_context(|| format!("activating host {}", host.id))?;
        Ok(Activation {
            pool: pool.to_string(),
            created_at: Some(now),
            remote,
        })
    }

    fn host(&self, id: &str) -> Option<&Host> {
        self.pools.values().flatten().find(|h| h.id == id)
    }
}

/// [`MachinesService`] of the static provider.
#[derive(Clone)]
pub struct StaticMachinesService {
    inner: Arc<Inventory>,
}

impl StaticMachinesService {
    pub fn new(
        user: &str,
        pools: BTreeMap<String, Vec<Host>>,
        keys: Arc<StdMutex<Keys>>,
        connector: Arc<dyn Connector>,
        requirements: Arc<Requirements>,
    ) -> Self {
        Self {
            inner: Arc::new(Inventory {
                user: user.to_string(),
                pools,
                keys,
                connector,
                requirements,
                cache: Mutex::new(None),
            }),
        }
    }

    fn machine(&self, id: &str, activation: &Activation) -> Result<Arc<dyn Machine>> {
        let host = self
            .inner
            .host(id)
            .ok_or_else(|| Error::validation(format!("unknown host {id}")))?;
        Ok(Arc::new(StaticMachine {
            id: host.id.clone(),
            ip: host.ip.clone(),
            pool: activation.pool.clone(),
            created_at: activation.created_at,
            remote: activation.remote.clone(),
            inventory: self.inner.clone(),
        }))
    }

    /// Writes the maintenance public key to every active host.
    pub async fn distribute_key(&self) -> Result<()> {
        let public = self.inner.public_key();
        let mut tasks = Vec::new();
        for pool in self.inner.pools.keys() {
            for machine in self.list(pool).await? {
                let public = public.clone();
                let path = authorized_keys(&self.inner.user);
                tasks.push(async move {
                    machine
                        .write_file(&path, format!("{public}\n").as_bytes(), 0o600)
                        .await
                        .with_context(|| format!("distributing key to {}", machine.id()))
                });
            }
        }
        fanout(tasks).await.map(|_| ())
    }
}

#[async_trait]
impl MachinesService for StaticMachinesService {
    async fn list_pools(&self) -> Result<Vec<String>> {
        Ok(self.inner.pools.keys().cloned().collect())
    }

    async fn list(&self, pool: &str) -> Result<Machines> {
        let mut cache = self.inner.cache.lock().await;
        let active = &self.inner.loaded(&mut cache).await?.active;
        let hosts = self.inner.pools.get(pool).map(Vec::as_slice).unwrap_or_default();
        hosts
            .iter()
            .filter_map(|h| active.get(&h.id).map(|a| (h, a)))
            .filter(|(_, a)| a.pool == pool)
            .map(|(h, a)| self.machine(&h.id, a))
            .collect()
    }

    async fn create(&self, pool: &str) -> Result<Arc<dyn Machine>> {
        let hosts = self
            .inner
            .pools
            .get(pool)
            .ok_or_else(|| Error::validation(format!("unknown pool {pool}")))?;

        let host = {
            let mut cache = self.inner.cache.lock().await;
            let state = self.inner.loaded(&mut cache).await?;
            let host = hosts
                .iter()
                .find(|h| !state.active.contains_key(&h.id) && !state.pending.contains(&h.id))
                .ok_or_else(|| Error::validation(format!("no machines left in pool {pool}")))?;
            state.pending.insert(host.id.clone());
            host
        };

        let activated = self.inner.activate(pool, host).await;

        if let Some(state) = self.inner.cache.lock().await.as_mut() {
            state.pending.remove(&host.id);
            if let Ok(activation) = &activated {
                state.active.insert(host.id.clone(), activation.clone());
            }
        }
        let activation = activated?;
        info!(pool, machine = %host.id, "Activated host");
        self.machine(&host.id, &activation)
    }

    fn requirements(&self) -> Arc<Requirements> {
        self.inner.requirements.clone()
    }
}

/// An activated static host.
pub struct StaticMachine {
    id: String,
    ip: String,
    pool: String,
    created_at: Option<DateTime<Utc>>,
    remote: Arc<dyn Remote>,
    inventory: Arc<Inventory>,
}

impl std::fmt::Debug for StaticMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticMachine")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("pool", &self.pool)
            .finish()
    }
}

#[async_trait]
impl Remote for StaticMachine {
    async fn execute(&self, stdin: Option<&[u8]>, cmd: &str) -> Result<Vec<u8>> {
        self.remote.execute(stdin, cmd).await
    }

    async fn shell(&self) -> Result<()> {
        self.remote.shell().await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.remote.read_file(path).await
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()> {
        self.remote.write_file(path, content, mode).await
    }
}

#[async_trait]
impl Machine for StaticMachine {
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
        self.inventory.requirements.reboot_required(&self.id)
    }

    fn replacement_required(&self) -> bool {
        self.inventory.requirements.replacement_required(&self.id)
    }

    async fn remove(&self) -> Result<()> {
        self.remote
            .execute(None, &format!("sudo rm -f {}", quote(&marker(&self.id))))
            .await
            .with_context(|| format!("deactivating host {}", self.id))?;
        if let Some(state) = self.inventory.cache.lock().await.as_mut() {
            state.active.remove(&self.id);
        }
        info!(pool = %self.pool, machine = %self.id, "Deactivated host");
        Ok(())
    }
}
