//! Load balancer kinds, owned by a provider.

pub mod dynamic;
pub mod external;

use crate::error::{Error, Result};
use crate::kinds::{Adaptation, Collaborators, KindId};
use crate::tree::Tree;

/// Network interfaces of the provider's machines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interfaces {
    /// Carries VRRP unless a virtual IP names its own interface.
    pub private: String,
    /// Tracked by VRRP: a machine losing one gives up its virtual IPs.
    pub external: Vec<String>,
}

/// Parses the load balancer document of `provider`.
pub fn adapt(
    provider: &str,
    interfaces: &Interfaces,
    tree: Tree,
    collab: &Collaborators,
) -> Result<Adaptation> {
    match KindId::resolve(&tree.common)? {
        KindId::DynamicLoadBalancer => dynamic::adapt(provider, interfaces, tree, collab),
        KindId::ExternalLoadBalancer => external::adapt(tree),
        other => Err(Error::validation(format!(
            "{other} is not a load balancer kind"
        ))),
    }
}
