//! [`Pool`] implementation on top of a [`MachinesService`].

use std::sync::Arc;

use async_trait::async_trait;

use super::{Machine, Machines, MachinesService, Pool, Requirements};
use crate::error::{Context, Error, Result};

/// Pool level invariant checked after every converged pass.
#[async_trait]
pub trait MembersCheck: Send + Sync {
    /// Returns whether the invariant already held.
    async fn ensure(&self, pool: &str, machines: &Machines) -> Result<bool>;
}

/// A pool backed by a provider's machines service.
pub struct ServicePool {
    name: String,
    svc: Arc<dyn MachinesService>,
    members: Option<Arc<dyn MembersCheck>>,
}

impl ServicePool {
    pub fn new(name: impl Into<String>, svc: Arc<dyn MachinesService>) -> Self {
        Self {
            name: name.into(),
            svc,
            members: None,
        }
    }

    pub fn with_members_check(mut self, check: Arc<dyn MembersCheck>) -> Self {
        self.members = Some(check);
        self
    }
}

#[async_trait]
impl Pool for ServicePool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn machines(&self) -> Result<Machines> {
        self.svc
            .list(&self.name)
            .await
            .with_context(|| format!("listing machines of pool {}", self.name))
    }

    async fn add_machine(&self) -> Result<Arc<dyn Machine>> {
        let machine = self
            .svc
            .create(&self.name)
            .await
            .with_context(|| format!("creating machine in pool {}", self.name))?;
        if machine.id().is_empty() {
            return Err(Error::remote(format!(
                "provider returned a machine without id for pool {}",
                self.name
            )));
        }
        Ok(machine)
    }

    async fn ensure_members(&self) -> Result<bool> {
        let Some(check) = &self.members else {
            return Ok(true);
        };
        let machines = self.machines().await?;
        check
            .ensure(&self.name, &machines)
            .await
            .with_context(|| format!("ensuring members of pool {}", self.name))
    }

    fn requirements(&self) -> Arc<Requirements> {
        self.svc.requirements()
    }
}
