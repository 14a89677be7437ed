//! Cluster kinds: consume pools and ingresses of providers.

pub mod kubernetes;

use crate::error::{Error, Result};
use crate::kinds::{Adaptation, Collaborators, KindId};
use crate::tree::Tree;

/// Parses the document of cluster `id`.
pub fn adapt(id: &str, tree: Tree, collab: &Collaborators) -> Result<Adaptation> {
    match KindId::resolve(&tree.common)? {
        KindId::KubernetesCluster => kubernetes::adapt(id, tree, collab),
        other => Err(Error::validation(format!("{other} is not a cluster kind"))),
    }
}
