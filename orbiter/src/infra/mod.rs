//! Provider-agnostic infrastructure contracts.
//!
//! - [`Machine`]: a handle to one host, reachable through [`Remote`]
//! - [`MachinesService`]: per provider inventory, lists and creates machines
//! - [`Pool`]: a [`MachinesService`] scoped to one pool name
//! - [`Requirements`]: operator requests (reboot, replacement) addressed by machine id

pub mod pool;
pub mod ssh;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use pool::{MembersCheck, ServicePool};
pub use ssh::{SshConnector, SshRemote};

/// Transport to a host: command execution and file transfer.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Run `cmd` on the host, feeding `stdin` if given, and return stdout.
    async fn execute(&self, stdin: Option<&[u8]>, cmd: &str) -> Result<Vec<u8>>;

    /// Attach an interactive shell to the host.
    async fn shell(&self) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> Result<()>;
}

/// A host owned by a provider.
///
/// The identity is immutable; only requirements and pool membership change.
#[async_trait]
pub trait Machine: Remote + fmt::Debug {
    fn id(&self) -> &str;

    /// Internal address other machines use to reach this one.
    fn ip(&self) -> &str;

    /// When the machine joined its pool, if the provider knows.
    fn created_at(&self) -> Option<DateTime<Utc>>;

    fn reboot_required(&self) -> bool;

    fn replacement_required(&self) -> bool;

    /// Remove the machine from its pool and the provider's inventory cache.
    async fn remove(&self) -> Result<()>;
}

pub type Machines = Vec<Arc<dyn Machine>>;

/// Per provider machine inventory.
///
/// All methods must be safe to call concurrently with themselves and each other.
#[async_trait]
pub trait MachinesService: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<String>>;

    async fn list(&self, pool: &str) -> Result<Machines>;

    async fn create(&self, pool: &str) -> Result<Arc<dyn Machine>>;

    /// Operator requirements for the machines of this provider.
    fn requirements(&self) -> Arc<Requirements>;
}

/// A homogeneous group of machines with a desired member count.
#[async_trait]
pub trait Pool: Send + Sync {
    fn name(&self) -> &str;

    /// Number of machines the provider wants for `instances` desired nodes.
    fn desired_members(&self, instances: usize) -> usize {
        instances
    }

    async fn machines(&self) -> Result<Machines>;

    async fn add_machine(&self) -> Result<Arc<dyn Machine>>;

    /// Ensure provider level invariants for the whole pool (e.g. load balancer
    /// membership). Returns whether nothing had to change.
    async fn ensure_members(&self) -> Result<bool>;

    fn requirements(&self) -> Arc<Requirements>;
}

/// Builds transports to statically known hosts.
pub trait Connector: Send + Sync {
    fn connect(&self, user: &str, ip: &str, private_keys: &[String]) -> Result<Arc<dyn Remote>>;
}

/// An operator request addressed to one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementCommand {
    RequireReboot(String),
    UnrequireReboot(String),
    RequireReplacement(String),
    UnrequireReplacement(String),
}

impl RequirementCommand {
    pub fn machine_id(&self) -> &str {
        match self {
            RequirementCommand::RequireReboot(id)
            | RequirementCommand::UnrequireReboot(id)
            | RequirementCommand::RequireReplacement(id)
            | RequirementCommand::UnrequireReplacement(id) => id,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            RequirementCommand::RequireReboot(_) => "reboot required",
            RequirementCommand::UnrequireReboot(_) => "reboot no longer required",
            RequirementCommand::RequireReplacement(_) => "replacement required",
            RequirementCommand::UnrequireReplacement(_) => "replacement no longer required",
        }
    }
}

#[derive(Debug, Default)]
struct RequirementsState {
    reboot: BTreeSet<String>,
    replacement: BTreeSet<String>,
}

/// Reboot and replacement requests of one provider, persisted in its desired state.
#[derive(Debug, Default)]
pub struct Requirements {
    state: Mutex<RequirementsState>,
}

impl Requirements {
    pub fn new(
        reboot: impl IntoIterator<Item = String>,
        replacement: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            state: Mutex::new(RequirementsState {
                reboot: reboot.into_iter().collect(),
                replacement: replacement.into_iter().collect(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequirementsState> {
        self.state.lock().expect("requirements lock poisoned")
    }

    /// Applies a command. Returns whether the requirements changed.
    pub fn apply(&self, cmd: &RequirementCommand) -> bool {
        let mut state = self.lock();
        let changed = match cmd {
            RequirementCommand::RequireReboot(id) => state.reboot.insert(id.clone()),
            RequirementCommand::UnrequireReboot(id) => state.reboot.remove(id),
            RequirementCommand::RequireReplacement(id) => state.replacement.insert(id.clone()),
            RequirementCommand::UnrequireReplacement(id) => state.replacement.remove(id),
        };
        changed
    }

    pub fn reboot_required(&self, id: &str) -> bool {
        self.lock().reboot.contains(id)
    }

    pub fn replacement_required(&self, id: &str) -> bool {
        self.lock().replacement.contains(id)
    }
}

/// Orders machines for scale down: the first `excess` returned are removed.
///
/// Newest machines go first so the longest serving members are preserved.
/// Machines without a known creation time count as oldest. Ties are broken by
/// id, descending, so the selection is deterministic for a given inventory.
pub fn select_for_removal(machines: &[Arc<dyn Machine>], excess: usize) -> Machines {
    let mut ordered: Machines = machines.to_vec();
    ordered.sort_by(|a, b| {
        b.created_at()
            .cmp(&a.created_at())
            .then_with(|| b.id().cmp(a.id()))
    });
    ordered.truncate(excess);
    ordered
}
