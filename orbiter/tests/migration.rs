//! Schema upgrades of nested kinds surface as a migrated orb document.

mod common;

use std::sync::Arc;

use common::{FakeClusterApi, FakeConnector, FakeNodeAgentInstaller, collaborators};
use orbiter::Error;
use orbiter::kinds::orb::{self, ParsedOrb};
use orbiter::kinds::{Adapter, KindId};
use orbiter::tree::Tree;
use tokio_test::assert_ok;

const CURRENT: &str = r#"
kind: orbiter.io/Orb
version: v0
providers:
  static:
    kind: orbiter.io/StaticProvider
    version: v1
    spec:
      remoteUser: orbiter
      externalInterfaces: []
      privateInterface: eth0
      pools:
        masters:
        - {id: m1, ip: 10.0.0.1}
    loadbalancing:
      kind: orbiter.io/DynamicLoadBalancer
      version: v1
      spec:
        masters:
        - ip: 10.0.0.100
          interface: eth0
          transport:
          - name: kubeapi
            frontendPort: 6443
            backendPort: 6443
            backendPools: [masters]
            whitelist: [10.0.0.0/8]
clusters:
  k8s:
    kind: orbiter.io/KubernetesCluster
    version: v0
    spec:
      controlPlane: {provider: static, pool: masters, nodes: 1}
      versions: {kubernetes: v1.21.0}
      networking: {podCidr: 10.1.0.0/16, serviceCidr: 10.2.0.0/16, domain: cluster.local}
"#;

fn parse(yaml: &str) -> orbiter::Result<ParsedOrb> {
    let collab = collaborators(
        Arc::new(FakeClusterApi::default()),
        Arc::new(FakeNodeAgentInstaller::default()),
        Arc::new(FakeConnector::default()),
    );
    orb::adapt(Tree::from_yaml(yaml)?, &collab)
}

#[test]
fn test_current_document_is_left_alone() {
    let parsed = assert_ok!(parse(CURRENT));
    assert!(!parsed.migrated);

    let reparsed = assert_ok!(parse(&parsed.orb.desired().unwrap().to_yaml().unwrap()));
    assert!(!reparsed.migrated);
}

#[test]
fn test_old_load_balancer_migrates_the_orb() {
    let yaml = CURRENT
        .replace(
            "kind: orbiter.io/DynamicLoadBalancer\n      version: v1",
            "kind: orbiter.io/DynamicLoadBalancer\n      version: v0",
        )
        .replace("            whitelist: [10.0.0.0/8]\n", "");
    let parsed = assert_ok!(parse(&yaml));
    assert!(parsed.migrated);

    let desired = parsed.orb.desired().unwrap();
    let lb = &desired.value["providers"]["static"]["loadbalancing"];
    assert_eq!(
        lb["version"].as_str(),
        Some(KindId::DynamicLoadBalancer.latest())
    );
    assert_eq!(
        lb["spec"]["masters"][0]["transport"][0]["whitelist"][0].as_str(),
        Some("0.0.0.0/0")
    );

    // Persisting the migrated document makes the next parse a no-op.
    let reparsed = assert_ok!(parse(&desired.to_yaml().unwrap()));
    assert!(!reparsed.migrated);
}

#[test]
fn test_provider_defaults_are_backfilled() {
    let yaml = CURRENT
        .replace("      externalInterfaces: []\n", "")
        .replace("      privateInterface: eth0\n", "");
    let parsed = assert_ok!(parse(&yaml));
    assert!(parsed.migrated);

    let desired = parsed.orb.desired().unwrap();
    let spec = &desired.value["providers"]["static"]["spec"];
    assert_eq!(spec["privateInterface"].as_str(), Some("eth0"));
    assert!(spec["externalInterfaces"].as_sequence().unwrap().is_empty());
}

#[test]
fn test_cluster_networking_is_backfilled() {
    let yaml = CURRENT.replace(
        "      networking: {podCidr: 10.1.0.0/16, serviceCidr: 10.2.0.0/16, domain: cluster.local}\n",
        "",
    );
    let parsed = assert_ok!(parse(&yaml));
    assert!(parsed.migrated);

    let desired = parsed.orb.desired().unwrap();
    let networking = &desired.value["clusters"]["k8s"]["spec"]["networking"];
    assert_eq!(networking["domain"].as_str(), Some("cluster.local"));
    assert!(networking["podCidr"].as_str().is_some());
}

#[test]
fn test_unknown_versions_are_rejected() {
    let yaml = CURRENT.replace(
        "kind: orbiter.io/StaticProvider\n    version: v1",
        "kind: orbiter.io/StaticProvider\n    version: v7",
    );
    let err = parse(&yaml).err().unwrap();
    assert!(matches!(err.root(), Error::UnknownVersion { .. }), "{err}");
}
