use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, reload, util::SubscriberInitExt};

use orbiter::infra::{RequirementCommand, SshConnector};
use orbiter::kinds::clusters::kubernetes::KubeadmApi;
use orbiter::kinds::{Collaborators, MachineCommand};
use orbiter::nodeagent::SystemdNodeAgent;
use orbiter::{Driver, FsStore, create_audit_logger};

/// orbiter - converges machines, clusters and load balancers
#[derive(Parser, Debug)]
#[command(name = "orbiter", version, about)]
struct Args {
    /// Directory holding the desired and current state documents
    #[arg(long, default_value = "/var/lib/orbiter")]
    store: PathBuf,

    /// Identifier of the managed orb
    #[arg(long, default_value = "orb")]
    orb_id: String,

    /// Tick interval in seconds
    #[arg(long, default_value = "60")]
    interval: u64,

    /// Seconds after which a converged orb is checked again
    #[arg(long, default_value = "600")]
    recheck: u64,

    /// Node agent version expected on every machine
    #[arg(long, default_value = "latest")]
    commit: String,

    /// Base URL node agent binaries are downloaded from
    #[arg(long, default_value = "https://releases.orbiter.io/node-agent")]
    node_agent_url: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the convergence loop until interrupted
    Takeoff,
    /// Run a single tick
    Once,
    /// Provision prerequisites such as ssh keys
    Configure,
    /// Tear down everything the orb owns
    Destroy,
    /// Require reboots of machines (<provider>.<pool>.<machine>)
    Reboot { machines: Vec<String> },
    /// Require replacements of machines (<provider>.<pool>.<machine>)
    Replace { machines: Vec<String> },
    /// List all active machines
    Machines,
}

async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
            info!("Received SIGINT");
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}

fn commands(
    machines: &[String],
    command: fn(String) -> RequirementCommand,
) -> Result<Vec<MachineCommand>> {
    machines
        .iter()
        .map(|m| MachineCommand::parse(m, command).map_err(Into::into))
        .collect()
}

fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("orbiter=debug,audit=info");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| "orbiter=info,audit=info".into())
}

#[tokio::main]
async fn main() -> Result<()> {
    let (filter, filter_handle) = reload::Layer::new(log_filter(false));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let store = FsStore::open(&args.store)
        .await
        .with_context(|| format!("Failed to open store {}", args.store.display()))?;
    let collab = Collaborators {
        audit: create_audit_logger("orbiter"),
        cluster_api: Arc::new(KubeadmApi),
        node_agent: Arc::new(SystemdNodeAgent::new(&args.node_agent_url)),
        connector: Arc::new(SshConnector),
        commit: args.commit.clone(),
    };
    let mut driver = Driver::new(
        Arc::new(store),
        collab,
        &args.orb_id,
        Duration::from_secs(args.recheck),
    )
    .with_verbosity(move |verbose| {
        if let Err(e) = filter_handle.reload(log_filter(verbose)) {
            tracing::warn!("Failed to change log level: {}", e);
        }
    });

    match args.command {
        Cmd::Takeoff => {
            info!("Starting orbiter for orb {}", args.orb_id);
            let shutdown = CancellationToken::new();
            let trigger = Arc::new(Notify::new());
            let token = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                token.cancel();
            });
            let hup = trigger.clone();
            tokio::spawn(async move {
                let Ok(mut hangup) = signal::unix::signal(signal::unix::SignalKind::hangup()) else {
                    return;
                };
                while hangup.recv().await.is_some() {
                    info!("Received SIGHUP, forcing a tick");
                    hup.notify_one();
                }
            });
            driver
                .run(Duration::from_secs(args.interval), trigger, shutdown)
                .await;
            info!("Shutdown complete");
        }
        Cmd::Once => {
            let done = driver.tick(CancellationToken::new()).await?;
            info!(done, "Tick finished");
        }
        Cmd::Configure => driver.configure().await?,
        Cmd::Destroy => driver.destroy().await?,
        Cmd::Reboot { machines } => {
            let changed = driver
                .apply_commands(&commands(&machines, RequirementCommand::RequireReboot)?)
                .await?;
            info!(changed, "Reboots required");
        }
        Cmd::Replace { machines } => {
            let changed = driver
                .apply_commands(&commands(
                    &machines,
                    RequirementCommand::RequireReplacement,
                )?)
                .await?;
            info!(changed, "Replacements required");
        }
        Cmd::Machines => {
            for address in driver.machines().await? {
                println!("{address}");
            }
        }
    }

    Ok(())
}
