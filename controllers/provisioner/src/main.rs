//! kubeseed
//!
//! Bootstraps a single-node control plane and runs the post-readiness
//! reconciliation tasks:
//! - Node role labels on the local node
//! - Cluster DNS ConfigMap
//! - Core registrations (NodeHosts, API addresses, rootless ports)
//! - Leader-only controllers behind a Lease
//!
//! The process runs until interrupted or until a fatal error is reported.

mod config;
mod error;
mod leader;
#[cfg(test)]
mod leader_test;
mod net;
mod orchestrator;
mod readiness;
mod registry;
mod retry;
mod runtime;
mod tasks;
#[cfg(test)]
mod test_utils;
mod token;

use crate::config::{fill_server_config, ServerConfig, Settings};
use crate::error::{FatalReporter, ProvisionError};
use crate::orchestrator::Orchestrator;
use crate::registry::ControllerRegistry;
use crate::runtime::K3sControlPlane;
use crate::tasks::node_hosts::{node_hosts_controller, NODE_HOSTS_RESYNC};
use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long background tasks get to wind down after a shutdown request
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "kubeseed", version, about = "Single-node control plane bootstrap")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the control plane and run until interrupted
    Provision,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("TLS crypto provider already installed");
    }

    match cli.command {
        Commands::Provision => provision().await,
    }
}

async fn provision() -> anyhow::Result<()> {
    info!("Starting kubeseed");

    let settings = Settings::from_env().context("loading settings")?;
    let mut config = ServerConfig::default();
    fill_server_config(&mut config, &settings).context("filling server config")?;

    info!("Configuration:");
    info!("  Data dir: {}", config.control.data_dir.display());
    info!("  Cluster CIDR: {:?}", config.control.cluster_ip_ranges);
    info!("  HTTPS port: {}", config.control.https_port);
    info!("  API server port: {}", config.control.api_server_port);
    info!("  Leader election: {}", !config.control.no_leader_elect);

    let cancel = CancellationToken::new();
    let (fatal, mut fatal_rx) = FatalReporter::channel();

    let runtime = K3sControlPlane::new(settings.k3s_bin.clone(), settings.server_token.clone());
    let registry = ControllerRegistry::new()
        .with_leader_controller(node_hosts_controller(NODE_HOSTS_RESYNC));
    let orchestrator = Orchestrator::new(Arc::new(runtime), fatal).with_registry(registry);

    let provisioned = match orchestrator.start_server(&config, &cancel).await {
        Ok(provisioned) => provisioned,
        Err(e) => {
            cancel.cancel();
            return Err(e).context("starting server");
        }
    };
    info!(advertise_ip = %provisioned.advertise_ip, "Control plane started");
    debug!(command = %provisioned.join_command, "Join command");

    let outcome = wait_for_stop(tokio::signal::ctrl_c(), &mut fatal_rx, &cancel).await;

    // the leader runner releases the lease on its way out
    let drain = async {
        if let Ok(Some(handles)) = provisioned.pipeline.await {
            if let Err(e) = handles.leader.await {
                warn!(error = %e, "Leader runner did not exit cleanly");
            }
            for (task, handle) in [("role labels", handles.role_labels), ("cluster dns", Some(handles.cluster_dns))] {
                let Some(handle) = handle else { continue };
                match handle.await {
                    Ok(outcome) => debug!(task, ?outcome, "Task stopped"),
                    Err(e) => warn!(task, error = %e, "Task did not exit cleanly"),
                }
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Background tasks did not stop in time");
    }

    outcome
}

/// Wait for a shutdown signal or the first fatal error, then cancel `cancel`.
///
/// The token is cancelled on every path, including a failure to listen for
/// the signal.
async fn wait_for_stop<S>(
    signal: S,
    fatal_rx: &mut mpsc::UnboundedReceiver<ProvisionError>,
    cancel: &CancellationToken,
) -> anyhow::Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    let outcome = tokio::select! {
        signal = signal => match signal {
            Ok(()) => {
                info!("Shutdown requested");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for shutdown signal, stopping");
                Err(anyhow::Error::new(e).context("listening for shutdown signal"))
            }
        },
        Some(err) = fatal_rx.recv() => {
            error!(error = %err, "Stopping after fatal error");
            Err(anyhow::Error::new(err))
        }
    };

    cancel.cancel();
    outcome
}
