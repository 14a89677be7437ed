//! Kind adapters.
//!
//! Each kind parses its desired document into a typed spec and exposes query,
//! destroy and configure through the [`Adapter`] trait. Kinds compose: the
//! orb holds providers and clusters, a provider holds its load balancer.

pub mod clusters;
pub mod loadbalancers;
pub mod orb;
pub mod providers;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::audit::OrbiterAuditLogger;
use crate::error::{Error, Result};
use crate::infra::{Connector, MembersCheck, Pool, RequirementCommand};
use crate::nodeagent::{NodeAgentInstaller, NodeAgents};
use crate::tree::{Common, Secrets, Tree};
use clusters::kubernetes::ClusterApi;

pub const DOMAIN: &str = "orbiter.io";

/// Closed registry of known kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindId {
    Orb,
    KubernetesCluster,
    StaticProvider,
    DynamicLoadBalancer,
    ExternalLoadBalancer,
}

impl KindId {
    pub fn name(&self) -> &'static str {
        match self {
            KindId::Orb => "Orb",
            KindId::KubernetesCluster => "KubernetesCluster",
            KindId::StaticProvider => "StaticProvider",
            KindId::DynamicLoadBalancer => "DynamicLoadBalancer",
            KindId::ExternalLoadBalancer => "ExternalLoadBalancer",
        }
    }

    /// Supported schema versions, oldest first.
    pub fn versions(&self) -> &'static [&'static str] {
        match self {
            KindId::Orb | KindId::KubernetesCluster | KindId::ExternalLoadBalancer => &["v0"],
            KindId::StaticProvider | KindId::DynamicLoadBalancer => &["v0", "v1"],
        }
    }

    pub fn latest(&self) -> &'static str {
        let versions = self.versions();
        versions[versions.len() - 1]
    }

    pub fn common(&self) -> Common {
        Common::new(&self.to_string(), self.latest())
    }

    /// Resolves a document's discriminators, rejecting unknown kinds and versions.
    pub fn resolve(common: &Common) -> Result<Self> {
        let kind: KindId = common.kind.parse()?;
        if !kind.versions().contains(&common.version.as_str()) {
            return Err(Error::UnknownVersion {
                kind: common.kind.clone(),
                version: common.version.clone(),
            });
        }
        Ok(kind)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", DOMAIN, self.name())
    }
}

impl FromStr for KindId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some(name) = s
            .strip_prefix(DOMAIN)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Err(Error::UnknownKind(s.to_string()));
        };
        match name {
            "Orb" => Ok(KindId::Orb),
            "KubernetesCluster" => Ok(KindId::KubernetesCluster),
            "StaticProvider" => Ok(KindId::StaticProvider),
            "DynamicLoadBalancer" => Ok(KindId::DynamicLoadBalancer),
            "ExternalLoadBalancer" => Ok(KindId::ExternalLoadBalancer),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// One convergence attempt. Built by [`Adapter::query`], consumed once.
pub struct EnsureFunc(Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<bool>> + Send>);

impl EnsureFunc {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        Self(Box::new(move |cancel| f(cancel).boxed()))
    }

    /// An ensure that has nothing to do.
    pub fn done() -> Self {
        Self::new(|_| async { Ok(true) })
    }

    /// Runs the attempt. Returns whether the kind now matches its desired state.
    pub async fn run(self, cancel: CancellationToken) -> Result<bool> {
        (self.0)(cancel).await
    }
}

/// Fails with [`Error::Cancelled`] once the tick was cancelled.
pub fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// A reachable endpoint exposed by a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub location: String,
    pub frontend_port: u16,
    pub backend_port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.location, self.frontend_port)
    }
}

/// What a provider hands to the kinds depending on it.
#[derive(Clone, Default)]
pub struct ProviderCurrent {
    pub pools: BTreeMap<String, Arc<dyn Pool>>,
    pub ingresses: BTreeMap<String, Address>,
}

/// Results of already queried kinds, passed to dependent kinds.
#[derive(Clone, Default)]
pub struct Delegates {
    pub providers: BTreeMap<String, ProviderCurrent>,
}

impl Delegates {
    pub fn with_provider(provider: &str, current: ProviderCurrent) -> Self {
        Self {
            providers: BTreeMap::from([(provider.to_string(), current)]),
        }
    }

    pub fn pool(&self, provider: &str, pool: &str) -> Result<Arc<dyn Pool>> {
        self.providers
            .get(provider)
            .ok_or_else(|| Error::validation(format!("unknown provider {provider}")))?
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| {
                Error::validation(format!("provider {provider} has no pool {pool}"))
            })
    }

    pub fn ingress(&self, provider: &str, name: &str) -> Option<&Address> {
        self.providers.get(provider)?.ingresses.get(name)
    }
}

/// Result of a query: the ensure step and, for providers, what they provide.
pub struct Queried {
    pub ensure: EnsureFunc,
    pub provides: Option<ProviderCurrent>,
}

impl Queried {
    pub fn new(ensure: EnsureFunc) -> Self {
        Self {
            ensure,
            provides: None,
        }
    }
}

/// Orb wide parameters for configure.
#[derive(Debug, Clone)]
pub struct OrbConfig {
    pub orb_id: String,
}

/// A requirement command addressed to a machine of a provider's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineCommand {
    pub provider: String,
    pub pool: String,
    pub command: RequirementCommand,
}

impl MachineCommand {
    /// Parses `<provider>.<pool>.<machine>` and builds the command for the machine id.
    pub fn parse(address: &str, command: fn(String) -> RequirementCommand) -> Result<Self> {
        let mut parts = address.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(provider), Some(pool), Some(machine))
                if !provider.is_empty() && !pool.is_empty() && !machine.is_empty() =>
            {
                Ok(Self {
                    provider: provider.to_string(),
                    pool: pool.to_string(),
                    command: command(machine.to_string()),
                })
            }
            _ => Err(Error::validation(format!(
                "machine address {address:?} is not of the form <provider>.<pool>.<machine>"
            ))),
        }
    }
}

/// Capabilities shared by all adapters of an orb.
#[derive(Clone)]
pub struct Collaborators {
    pub audit: Arc<OrbiterAuditLogger>,
    pub cluster_api: Arc<dyn ClusterApi>,
    pub node_agent: Arc<dyn NodeAgentInstaller>,
    pub connector: Arc<dyn Connector>,
    /// Node agent version expected on every machine.
    pub commit: String,
}

/// A parsed kind.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Builds one ensure step. Never mutates remote state itself.
    async fn query(&self, agents: &NodeAgents, delegates: &Delegates) -> Result<Queried>;

    /// Tears down everything the kind owns, children first.
    async fn destroy(&self, agents: &NodeAgents, delegates: &Delegates) -> Result<()>;

    /// One time bootstrap. Must be a no-op when already configured.
    async fn configure(&self, orb: &OrbConfig) -> Result<()>;

    /// Pools and ingresses without querying. Only providers return something.
    async fn delegate(&self) -> Result<Option<ProviderCurrent>> {
        Ok(None)
    }

    /// The desired document, including applied commands and migrations.
    fn desired(&self) -> Result<Tree>;

    /// The current document as observed by the last query and ensure.
    fn current(&self) -> Result<Tree>;

    /// Applies a requirement command. Returns whether the desired state changed.
    fn command(&self, _cmd: &MachineCommand) -> Result<bool> {
        Ok(false)
    }

    /// Pools this kind still references.
    fn references(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Pool invariant this kind wants checked after every pass.
    fn members_check(&self, _agents: &NodeAgents) -> Option<Arc<dyn MembersCheck>> {
        None
    }

    /// Whether the document asks for debug logging.
    fn verbose(&self) -> bool {
        false
    }
}

/// Output of parsing a desired document.
pub struct Adaptation {
    pub adapter: Arc<dyn Adapter>,
    /// The document was rewritten (version upgrade or back-filled defaults).
    pub migrated: bool,
    pub secrets: Secrets,
}

/// Upgrades `tree` to the latest version of its kind, one version at a time.
///
/// `step` receives the version being left and migrates the tree in place.
pub(crate) fn upgrade(
    kind: KindId,
    tree: &mut Tree,
    mut step: impl FnMut(&str, &mut Tree) -> Result<()>,
) -> Result<bool> {
    let versions = kind.versions();
    let mut idx = versions
        .iter()
        .position(|v| *v == tree.common.version)
        .ok_or_else(|| Error::UnknownVersion {
            kind: tree.common.kind.clone(),
            version: tree.common.version.clone(),
        })?;
    let mut migrated = false;
    while idx + 1 < versions.len() {
        step(versions[idx], tree)?;
        idx += 1;
        tree.set_version(versions[idx]);
        migrated = true;
    }
    Ok(migrated)
}
