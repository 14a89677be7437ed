use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use super::version::KubernetesVersion;
use crate::error::{Error, Result};
use crate::kinds::{KindId, upgrade};
use crate::tree::Tree;

pub const DEFAULT_POD_CIDR: &str = "100.127.224.0/20";
pub const DEFAULT_SERVICE_CIDR: &str = "100.126.4.0/22";
pub const DEFAULT_DOMAIN: &str = "cluster.local";

/// Nodes of one tier, taken from a provider's pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub provider: String,
    pub pool: String,
    pub nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    pub kubernetes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    pub pod_cidr: String,
    pub service_cidr: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    pub control_plane: PoolRef,
    #[serde(default)]
    pub workers: Vec<PoolRef>,
    pub versions: Versions,
    pub networking: Networking,
    #[serde(default)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Desired {
    pub spec: Spec,
}

impl Spec {
    pub fn version(&self) -> Result<KubernetesVersion> {
        self.versions.kubernetes.parse()
    }
}

pub fn parse(mut tree: Tree) -> Result<(Desired, bool)> {
    let mut migrated = upgrade(KindId::KubernetesCluster, &mut tree, |_, _| Ok(()))?;
    for (field, default) in [
        ("podCidr", DEFAULT_POD_CIDR),
        ("serviceCidr", DEFAULT_SERVICE_CIDR),
        ("domain", DEFAULT_DOMAIN),
    ] {
        migrated |= tree.backfill(&["spec", "networking", field], Value::from(default));
    }

    let desired: Desired = tree.decode()?;
    validate(&desired.spec)?;
    Ok((desired, migrated))
}

fn validate(spec: &Spec) -> Result<()> {
    spec.version()?;
    if spec.control_plane.nodes == 0 {
        return Err(Error::validation("control plane needs at least one node"));
    }
    let mut seen = BTreeSet::new();
    for pool in std::iter::once(&spec.control_plane).chain(&spec.workers) {
        if pool.provider.is_empty() || pool.pool.is_empty() {
            return Err(Error::validation("pool reference needs a provider and a pool"));
        }
        if !seen.insert((pool.provider.as_str(), pool.pool.as_str())) {
            return Err(Error::validation(format!(
                "pool {}.{} is used more than once",
                pool.provider, pool.pool
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPLETE: &str = r#"
kind: orbiter.io/KubernetesCluster
version: v0
spec:
  controlPlane: {provider: static, pool: masters, nodes: 1}
  workers:
  - {provider: static, pool: workers, nodes: 2}
  versions: {kubernetes: v1.21.0}
  networking: {podCidr: 10.1.0.0/16, serviceCidr: 10.2.0.0/16, domain: example.local}
"#;

    #[test]
    fn test_complete_document() {
        let (desired, migrated) = parse(Tree::from_yaml(COMPLETE).unwrap()).unwrap();
        assert!(!migrated);
        assert_eq!(desired.spec.networking.domain, "example.local");
        assert_eq!(desired.spec.workers[0].nodes, 2);
    }

    #[test]
    fn test_missing_networking_is_backfilled() {
        let tree = Tree::from_yaml(
            "kind: orbiter.io/KubernetesCluster\nversion: v0\nspec:\n  controlPlane: {provider: static, pool: masters, nodes: 1}\n  versions: {kubernetes: v1.21.0}\n",
        )
        .unwrap();
        let (desired, migrated) = parse(tree).unwrap();
        assert!(migrated);
        assert_eq!(desired.spec.networking.pod_cidr, DEFAULT_POD_CIDR);
        assert_eq!(desired.spec.networking.domain, DEFAULT_DOMAIN);
    }

    #[test]
    fn test_rejects_shared_pools() {
        let yaml = COMPLETE.replace("pool: workers", "pool: masters");
        assert!(matches!(
            parse(Tree::from_yaml(&yaml).unwrap()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_bad_version() {
        let yaml = COMPLETE.replace("v1.21.0", "latest");
        assert!(parse(Tree::from_yaml(&yaml).unwrap()).is_err());
    }
}
