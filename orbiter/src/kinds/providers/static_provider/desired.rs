use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};
use crate::kinds::{KindId, upgrade};
use crate::tree::{Secret, Secrets, Tree};

/// A statically known host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub ip: String,
    #[serde(default)]
    pub reboot_required: bool,
    #[serde(default)]
    pub replacement_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keys {
    #[serde(default, skip_serializing_if = "Secret::is_empty")]
    pub bootstrap_key_private: Secret,
    #[serde(default, skip_serializing_if = "Secret::is_empty")]
    pub maintenance_key_private: Secret,
    #[serde(default, skip_serializing_if = "Secret::is_empty")]
    pub maintenance_key_public: Secret,
}

impl Keys {
    pub fn has_maintenance(&self) -> bool {
        !self.maintenance_key_private.is_empty() && !self.maintenance_key_public.is_empty()
    }

    /// Private keys to try, maintenance first.
    pub fn private(&self) -> Vec<String> {
        [&self.maintenance_key_private, &self.bootstrap_key_private]
            .into_iter()
            .filter(|k| !k.is_empty())
            .map(|k| k.value.clone())
            .collect()
    }

    pub fn secrets(&self) -> Secrets {
        Secrets::from([
            ("bootstrapkeyprivate".to_string(), self.bootstrap_key_private.clone()),
            ("maintenancekeyprivate".to_string(), self.maintenance_key_private.clone()),
            ("maintenancekeypublic".to_string(), self.maintenance_key_public.clone()),
        ])
    }
}

fn default_user() -> String {
    "orbiter".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_user")]
    pub remote_user: String,
    #[serde(default)]
    pub pools: BTreeMap<String, Vec<Host>>,
    #[serde(default)]
    pub keys: Keys,
    #[serde(default)]
    pub external_interfaces: Vec<String>,
    #[serde(default)]
    pub private_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Desired {
    pub spec: Spec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadbalancing: Option<Tree>,
}

/// Decodes a static provider document, upgrading v0 and back-filling defaults.
pub fn parse(mut tree: Tree) -> Result<(Desired, bool)> {
    let mut migrated = upgrade(KindId::StaticProvider, &mut tree, |_, _| Ok(()))?;
    migrated |= tree.backfill(&["spec", "externalInterfaces"], Value::Sequence(Vec::new()));
    migrated |= tree.backfill(&["spec", "privateInterface"], Value::from("eth0"));

    let desired: Desired = tree.decode()?;
    validate(&desired.spec)?;
    Ok((desired, migrated))
}

fn validate(spec: &Spec) -> Result<()> {
    if spec.remote_user.is_empty() {
        return Err(Error::validation("remote user must not be empty"));
    }
    let mut ids = BTreeSet::new();
    for (pool, hosts) in &spec.pools {
        for host in hosts {
            if host.id.is_empty() || host.ip.is_empty() {
                return Err(Error::validation(format!(
                    "host of pool {pool} needs an id and an ip"
                )));
            }
            if !ids.insert(host.id.as_str()) {
                return Err(Error::validation(format!("host id {} is not unique", host.id)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: &str = r#"
kind: orbiter.io/StaticProvider
version: v1
spec:
  remoteUser: orbiter
  externalInterfaces: []
  privateInterface: eth0
  pools:
    masters:
    - id: m1
      ip: 10.0.0.1
"#;

    #[test]
    fn test_complete_document_is_not_migrated() {
        let (desired, migrated) = parse(Tree::from_yaml(V1).unwrap()).unwrap();
        assert!(!migrated);
        assert_eq!(desired.spec.pools["masters"][0].id, "m1");
        assert!(!desired.spec.pools["masters"][0].reboot_required);
    }

    #[test]
    fn test_v0_is_upgraded_and_backfilled() {
        let tree = Tree::from_yaml(
            "kind: orbiter.io/StaticProvider\nversion: v0\nspec:\n  pools:\n    masters:\n    - id: m1\n      ip: 10.0.0.1\n",
        )
        .unwrap();
        let (desired, migrated) = parse(tree).unwrap();
        assert!(migrated);
        assert!(desired.spec.external_interfaces.is_empty());
        assert_eq!(desired.spec.private_interface, "eth0");
    }

    #[test]
    fn test_duplicate_hosts_are_rejected() {
        let tree = Tree::from_yaml(
            "kind: orbiter.io/StaticProvider\nversion: v1\nspec:\n  pools:\n    a:\n    - id: m1\n      ip: 10.0.0.1\n    b:\n    - id: m1\n      ip: 10.0.0.2\n",
        )
        .unwrap();
        assert!(matches!(parse(tree), Err(Error::Validation(_))));
    }

    #[test]
    fn test_keys_prefer_maintenance() {
        let keys = Keys {
            bootstrap_key_private: Secret::new("boot"),
            maintenance_key_private: Secret::new("maint"),
            maintenance_key_public: Secret::new("pub"),
        };
        assert_eq!(keys.private(), vec!["maint", "boot"]);
        assert!(keys.has_maintenance());
    }
}
