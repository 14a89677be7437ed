//! Load balancing managed outside of orbiter.
//!
//! The operator lists the ingresses the external load balancer exposes; they
//! are handed to clusters as is.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kinds::{
    Adaptation, Adapter, Address, Delegates, EnsureFunc, KindId, OrbConfig, ProviderCurrent,
    Queried,
};
use crate::nodeagent::NodeAgents;
use crate::tree::{Secrets, Tree};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Desired {
    #[serde(default)]
    spec: BTreeMap<String, Address>,
}

#[derive(Debug, Serialize)]
struct Current<'a> {
    current: CurrentBody<'a>,
}

#[derive(Debug, Serialize)]
struct CurrentBody<'a> {
    ingresses: &'a BTreeMap<String, Address>,
}

pub struct ExternalLoadBalancer {
    ingresses: BTreeMap<String, Address>,
}

pub fn adapt(tree: Tree) -> Result<Adaptation> {
    let desired: Desired = tree.decode()?;
    for (name, address) in &desired.spec {
        if address.location.is_empty() {
            return Err(Error::validation(format!(
                "external ingress {name} has no location"
            )));
        }
    }
    Ok(Adaptation {
        adapter: Arc::new(ExternalLoadBalancer {
            ingresses: desired.spec,
        }),
        migrated: false,
        secrets: Secrets::new(),
    })
}

#[async_trait]
impl Adapter for ExternalLoadBalancer {
    async fn query(&self, _agents: &NodeAgents, _delegates: &Delegates) -> Result<Queried> {
        Ok(Queried {
            ensure: EnsureFunc::done(),
            provides: Some(ProviderCurrent {
                pools: BTreeMap::new(),
                ingresses: self.ingresses.clone(),
            }),
        })
    }

    async fn destroy(&self, _agents: &NodeAgents, _delegates: &Delegates) -> Result<()> {
        Ok(())
    }

    async fn configure(&self, _orb: &OrbConfig) -> Result<()> {
        Ok(())
    }

    fn desired(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::ExternalLoadBalancer.common(),
            &Desired {
                spec: self.ingresses.clone(),
            },
        )
    }

    fn current(&self) -> Result<Tree> {
        Tree::encode(
            &KindId::ExternalLoadBalancer.common(),
            &Current {
                current: CurrentBody {
                    ingresses: &self.ingresses,
                },
            },
        )
    }
}
