//! Convergence driver.
//!
//! Every tick reads the state documents, parses the orb, runs one query and
//! one ensure and commits what was observed. Ticks never overlap. A converged
//! orb is only looked at again when triggered or when the recheck period has
//! passed.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::error::{Context, Error, Result};
use crate::kinds::orb::{self, ParsedOrb};
use crate::kinds::{Adapter, Collaborators, Delegates, MachineCommand, OrbConfig};
use crate::nodeagent::{NodeAgents, NodeAgentsCurrent, NodeAgentsDesired};
use crate::store::{
    CURRENT_PATH, DESIRED_PATH, Document, DocumentStore, NODE_AGENTS_CURRENT_PATH,
    NODE_AGENTS_DESIRED_PATH,
};
use crate::tree::Tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Converging,
    Converged,
}

/// Documents of one revision.
struct Loaded {
    revision: u64,
    parsed: ParsedOrb,
    agents: NodeAgents,
}

/// Called with the orb's verbosity whenever it changes.
pub type VerbosityHook = Box<dyn Fn(bool) + Send + Sync>;

pub struct Driver {
    store: Arc<dyn DocumentStore>,
    collab: Collaborators,
    orb: OrbConfig,
    recheck: Duration,
    configured: bool,
    state: State,
    converged_at: Option<Instant>,
    verbose: Option<bool>,
    on_verbose: Option<VerbosityHook>,
}

async fn read_yaml<T: DeserializeOwned + Default>(
    store: &dyn DocumentStore,
    path: &str,
) -> Result<T> {
    match store.read(path).await? {
        Some(content) if !content.iter().all(u8::is_ascii_whitespace) => {
            serde_yaml::from_slice(&content)
                .map_err(Error::from)
                .with_context(|| format!("decoding {path}"))
        }
        _ => Ok(T::default()),
    }
}

impl Driver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collab: Collaborators,
        orb_id: &str,
        recheck: Duration,
    ) -> Self {
        Self {
            store,
            collab,
            orb: OrbConfig {
                orb_id: orb_id.to_string(),
            },
            recheck,
            configured: false,
            state: State::Converging,
            converged_at: None,
            verbose: None,
            on_verbose: None,
        }
    }

    pub fn with_verbosity(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_verbose = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    async fn load(&self) -> Result<Loaded> {
        let revision = self.store.revision().await?;
        let content = self
            .store
            .read(DESIRED_PATH)
            .await?
            .ok_or_else(|| Error::validation(format!("no desired state at {DESIRED_PATH}")))?;
        let tree = Tree::from_value(serde_yaml::from_slice(&content)?)?;
        let parsed = orb::adapt(tree, &self.collab).context("parsing desired state")?;
        if parsed.migrated {
            self.collab.audit.migrated("orb");
        }

        let desired: NodeAgentsDesired =
            read_yaml(self.store.as_ref(), NODE_AGENTS_DESIRED_PATH).await?;
        let current: NodeAgentsCurrent =
            read_yaml(self.store.as_ref(), NODE_AGENTS_CURRENT_PATH).await?;
        Ok(Loaded {
            revision,
            parsed,
            agents: NodeAgents::new(desired, current),
        })
    }

    /// Runs one query and ensure. Returns whether the orb has converged.
    pub async fn tick(&mut self, cancel: CancellationToken) -> Result<bool> {
        let Loaded {
            revision,
            parsed,
            agents,
        } = self.load().await?;
        let orb = parsed.orb;

        let verbose = orb.verbose();
        if self.verbose != Some(verbose) {
            self.verbose = Some(verbose);
            if let Some(hook) = &self.on_verbose {
                hook(verbose);
            }
        }

        let before = orb.desired()?;
        if !self.configured {
            orb.configure(&self.orb).await?;
            self.configured = true;
        }

        let result = match orb.query(&agents, &Delegates::default()).await {
            Ok(queried) => queried.ensure.run(cancel).await,
            Err(e) => Err(e),
        };

        let desired = orb.desired()?;
        let mut files = vec![
            Document::new(CURRENT_PATH, orb.current()?.to_yaml()?),
            Document::new(
                NODE_AGENTS_DESIRED_PATH,
                serde_yaml::to_string(&agents.desired_snapshot())?,
            ),
        ];
        if parsed.migrated || desired != before {
            files.push(Document::new(DESIRED_PATH, desired.to_yaml()?));
        }
        let message = match &result {
            Ok(true) => "orbiter: converged",
            Ok(false) => "orbiter: converging",
            Err(_) => "orbiter: ensure failed",
        };
        self.store
            .commit(revision, files, message)
            .await
            .context("persisting current state")?;

        let done = result?;
        self.state = if done {
            State::Converged
        } else {
            State::Converging
        };
        Ok(done)
    }

    fn due(&self) -> bool {
        match (self.state, self.converged_at) {
            (State::Converged, Some(at)) => at.elapsed() >= self.recheck,
            _ => true,
        }
    }

    /// Runs ticks every `interval` until `shutdown` is cancelled.
    ///
    /// `trigger` forces the next tick even when converged.
    pub async fn run(&mut self, interval: Duration, trigger: Arc<Notify>, shutdown: CancellationToken) {
        info!(orb = %self.orb.orb_id, ?interval, recheck = ?self.recheck, "Driver started");
        loop {
            if self.due() {
                let span = info_span!("tick", tick = %Uuid::new_v4());
                let cancel = shutdown.child_token();
                match self.tick(cancel).instrument(span).await {
                    Ok(true) => {
                        if self.converged_at.is_none() {
                            info!(orb = %self.orb.orb_id, "Orb converged");
                        }
                        self.converged_at = Some(Instant::now());
                    }
                    Ok(false) => {
                        self.converged_at = None;
                        debug!(orb = %self.orb.orb_id, "Orb converging");
                    }
                    Err(e) if e.is_transient() => {
                        warn!(orb = %self.orb.orb_id, error = %e, "Tick failed, retrying");
                    }
                    Err(e) => {
                        error!(orb = %self.orb.orb_id, error = %e, "Tick failed");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = trigger.notified() => {
                    debug!("Tick triggered");
                    self.state = State::Converging;
                    self.converged_at = None;
                }
            }
        }
        info!(orb = %self.orb.orb_id, "Driver stopped");
    }

    /// Runs configure and persists generated prerequisites.
    pub async fn configure(&mut self) -> Result<()> {
        let loaded = self.load().await?;
        let orb = loaded.parsed.orb;
        let before = orb.desired()?;
        orb.configure(&self.orb).await?;
        self.configured = true;
        let desired = orb.desired()?;
        if loaded.parsed.migrated || desired != before {
            self.store
                .commit(
                    loaded.revision,
                    vec![Document::new(DESIRED_PATH, desired.to_yaml()?)],
                    "orbiter: configured",
                )
                .await?;
        }
        Ok(())
    }

    /// Applies machine commands to the desired state. Returns whether it changed.
    pub async fn apply_commands(&self, commands: &[MachineCommand]) -> Result<bool> {
        let loaded = self.load().await?;
        let orb = loaded.parsed.orb;
        let mut changed = false;
        for cmd in commands {
            changed |= orb.command(cmd)?;
        }
        if changed || loaded.parsed.migrated {
            self.store
                .commit(
                    loaded.revision,
                    vec![Document::new(DESIRED_PATH, orb.desired()?.to_yaml()?)],
                    "orbiter: machine requirements changed",
                )
                .await?;
        }
        Ok(changed)
    }

    /// Addresses of every active machine.
    pub async fn machines(&self) -> Result<Vec<String>> {
        self.load().await?.parsed.orb.machines().await
    }

    /// Tears the orb down and truncates the internal documents.
    pub async fn destroy(&self) -> Result<()> {
        let loaded = self.load().await?;
        let orb = loaded.parsed.orb;
        orb.destroy(&loaded.agents, &Delegates::default()).await?;
        self.store
            .commit(
                loaded.revision,
                vec![
                    Document::new(DESIRED_PATH, orb.desired()?.to_yaml()?),
                    Document::new(CURRENT_PATH, ""),
                    Document::new(NODE_AGENTS_DESIRED_PATH, ""),
                    Document::new(NODE_AGENTS_CURRENT_PATH, ""),
                ],
                "orbiter: destroyed",
            )
            .await?;
        self.collab.audit.orb_destroyed(&self.orb.orb_id);
        Ok(())
    }
}
