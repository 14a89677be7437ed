//! Provider kinds: own machines and, optionally, a load balancer.

pub mod core;
pub mod static_provider;

use crate::error::{Error, Result};
use crate::kinds::{Adaptation, Collaborators, KindId};
use crate::tree::Tree;

pub use self::core::ProviderCore;

/// Parses the document of provider `id`.
pub fn adapt(id: &str, tree: Tree, collab: &Collaborators) -> Result<Adaptation> {
    match KindId::resolve(&tree.common)? {
        KindId::StaticProvider => static_provider::adapt(id, tree, collab),
        other => Err(Error::validation(format!("{other} is not a provider kind"))),
    }
}
