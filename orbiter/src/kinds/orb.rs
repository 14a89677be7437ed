//! The root kind. Holds providers and the clusters built on their pools.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Context, Error, Result};
use crate::fanout::fanout;
use crate::kinds::{
    Adapter, Collaborators, Delegates, EnsureFunc, KindId, MachineCommand, OrbConfig, Queried,
    checkpoint, clusters, providers, upgrade,
};
use crate::nodeagent::NodeAgents;
use crate::tree::{Secrets, Tree, append_secrets};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrbSpec {
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Deserialize)]
struct OrbDesired {
    #[serde(default)]
    spec: OrbSpec,
    #[serde(default)]
    providers: BTreeMap<String, Tree>,
    #[serde(default)]
    clusters: BTreeMap<String, Tree>,
}

#[derive(Serialize)]
struct Encoded<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<&'a OrbSpec>,
    providers: BTreeMap<&'a str, Tree>,
    clusters: BTreeMap<&'a str, Tree>,
}

type Kinds = Vec<(String, Arc<dyn Adapter>)>;

pub struct Orb {
    spec: OrbSpec,
    providers: Kinds,
    clusters: Kinds,
}

/// A parsed orb document.
pub struct ParsedOrb {
    pub orb: Arc<Orb>,
    pub migrated: bool,
    pub secrets: Secrets,
}

/// Parses the orb and every kind below it.
pub fn adapt(mut tree: Tree, collab: &Collaborators) -> Result<ParsedOrb> {
    if KindId::resolve(&tree.common)? != KindId::Orb {
        return Err(Error::validation(format!(
            "expected {}, got {}",
            KindId::Orb,
            tree.common.kind
        )));
    }
    let mut migrated = upgrade(KindId::Orb, &mut tree, |_, _| Ok(()))?;
    let desired: OrbDesired = tree.decode()?;

    let mut secrets = Secrets::new();
    let mut providers = Vec::new();
    for (id, tree) in desired.providers {
        let a = providers::adapt(&id, tree, collab)?;
        migrated |= a.migrated;
        append_secrets(&format!("providers.{id}"), &mut secrets, a.secrets);
        providers.push((id, a.adapter));
    }

    let mut clusters = Vec::new();
    for (id, tree) in desired.clusters {
        let a = clusters::adapt(&id, tree, collab)?;
        migrated |= a.migrated;
        append_secrets(&format!("clusters.{id}"), &mut secrets, a.secrets);
        clusters.push((id, a.adapter));
    }

    Ok(ParsedOrb {
        orb: Arc::new(Orb {
            spec: desired.spec,
            providers,
            clusters,
        }),
        migrated,
        secrets,
    })
}

async fn run_all(ensures: Vec<(String, EnsureFunc)>, cancel: &CancellationToken) -> Result<bool> {
    let tasks = ensures.into_iter().map(|(id, ensure)| {
        let cancel = cancel.clone();
        async move {
            let done = ensure
                .run(cancel)
                .await
                .with_context(|| format!("ensuring {id}"))?;
            debug!(kind = %id, done, "Ensured");
            Ok::<_, Error>(done)
        }
    });
    Ok(fanout(tasks).await?.into_iter().all(|done| done))
}

impl Orb {
    fn provider(&self, id: &str) -> Result<&Arc<dyn Adapter>> {
        self.providers
            .iter()
            .find(|(p, _)| p == id)
            .map(|(_, a)| a)
            .ok_or_else(|| Error::validation(format!("unknown provider {id}")))
    }

    /// Pools of every provider, without querying them.
    async fn delegates(&self) -> Result<Delegates> {
        let mut delegates = Delegates::default();
        for (id, provider) in &self.providers {
            if let Some(current) = provider.delegate().await? {
                delegates.providers.insert(id.clone(), current);
            }
        }
        Ok(delegates)
    }

    /// Addresses (`<provider>.<pool>.<machine>`) of every active machine.
    pub async fn machines(&self) -> Result<Vec<String>> {
        let mut addresses = Vec::new();
        for (provider, current) in self.delegates().await?.providers {
            for (pool, p) in current.pools {
                for m in p.machines().await? {
                    addresses.push(format!("{provider}.{pool}.{}", m.id()));
                }
            }
        }
        Ok(addresses)
    }
}

#[async_trait]
impl Adapter for Orb {
    async fn query(&self, agents: &NodeAgents, _delegates: &Delegates) -> Result<Queried> {
        let mut delegates = Delegates::default();
        let mut provider_ensures = Vec::new();
        for (id, provider) in &self.providers {
            let queried = provider
                .query(agents, &Delegates::default())
                .await
                .with_context(|| format!("querying provider {id}"))?;
            delegates
                .providers
                .insert(id.clone(), queried.provides.unwrap_or_default());
            provider_ensures.push((format!("provider {id}"), queried.ensure));
        }

        let mut cluster_ensures = Vec::new();
        for (id, cluster) in &self.clusters {
            let queried = cluster
                .query(agents, &delegates)
                .await
                .with_context(|| format!("querying cluster {id}"))?;
            cluster_ensures.push((format!("cluster {id}"), queried.ensure));
        }

        Ok(Queried::new(EnsureFunc::new(move |cancel| async move {
            let providers_done = run_all(provider_ensures, &cancel).await?;
            checkpoint(&cancel)?;
            let clusters_done = run_all(cluster_ensures, &cancel).await?;
            Ok(providers_done && clusters_done)
        })))
    }

    async fn destroy(&self, agents: &NodeAgents, _delegates: &Delegates) -> Result<()> {
        let delegates = self.delegates().await?;
        for (id, cluster) in &self.clusters {
            cluster
                .destroy(agents, &delegates)
                .await
                .with_context(|| format!("destroying cluster {id}"))?;
        }
        let tasks = self.providers.iter().map(|(id, provider)| {
            let (id, provider, agents) = (id.clone(), provider.clone(), agents.clone());
            async move {
                provider
                    .destroy(&agents, &Delegates::default())
                    .await
                    .with_context(|| format!("destroying provider {id}"))
            }
        });
        fanout(tasks).await?;
        Ok(())
    }

    async fn configure(&self, orb: &OrbConfig) -> Result<()> {
        for (id, kind) in self.providers.iter().chain(&self.clusters) {
            kind.configure(orb)
                .await
                .with_context(|| format!("configuring {id}"))?;
        }
        info!(orb = %orb.orb_id, "Orb configured");
        Ok(())
    }

    fn desired(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::Orb.common(),
            &Encoded {
                spec: Some(&self.spec),
                providers: encode_all(&self.providers, |a| a.desired())?,
                clusters: encode_all(&self.clusters, |a| a.desired())?,
            },
        )
    }

    fn current(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::Orb.common(),
            &Encoded {
                spec: None,
                providers: encode_all(&self.providers, |a| a.current())?,
                clusters: encode_all(&self.clusters, |a| a.current())?,
            },
        )
    }

    fn command(&self, cmd: &MachineCommand) -> Result<bool> {
        self.provider(&cmd.provider)?.command(cmd)
    }

    /// Whether the orb or any kind in it asks for debug logging.
    fn verbose(&self) -> bool {
        self.spec.verbose
            || self
                .providers
                .iter()
                .chain(&self.clusters)
                .any(|(_, kind)| kind.verbose())
    }
}

fn encode_all<'a>(
    kinds: &'a Kinds,
    f: impl Fn(&dyn Adapter) -> Result<Tree>,
) -> Result<BTreeMap<&'a str, Tree>> {
    kinds
        .iter()
        .map(|(id, a)| Ok((id.as_str(), f(a.as_ref())?)))
        .collect()
}
