//! Node update agent.
//!
//! Runs on every cluster node and drives OS update cycles for the local
//! node: search, download, wait for coordinator approval, install, and the
//! optional reboot, persisting progress so restarts and reboots resume
//! exactly where the previous process stopped.

use std::sync::Arc;

use anyhow::Result;
use pos_model::OperationCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pos_node_agent::checkpoint::CheckpointStore;
use pos_node_agent::client::HttpCoordinatorClient;
use pos_node_agent::config::Config;
use pos_node_agent::engine::MockEngine;
use pos_node_agent::os::HostOs;
use pos_node_agent::scheduler::{Agent, AgentError};
use pos_node_agent::settings::NodeSettings;
use pos_node_agent::workdir::WorkDir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting node update agent");

    let config = Config::from_env()?;
    info!(
        node = %config.node_name,
        coordinator_url = %config.coordinator_url,
        work_dir = %config.work_dir,
        "Configuration loaded"
    );

    let workdir = WorkDir::new(&config.work_dir);
    workdir.ensure_layout()?;

    // The engine seam is wired to the mock here; a host deployment links the
    // platform's engine implementation instead.
    let engine = Arc::new(MockEngine::new());
    let channel = Arc::new(
        HttpCoordinatorClient::new(&config, NodeSettings::default().operation_timeout)
            .with_checkpoints(CheckpointStore::new(workdir.clone())),
    );
    let os = Arc::new(HostOs);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut agent = Agent::new(config, workdir, engine, channel, os);
    match agent.run(shutdown_rx).await {
        Ok(()) => Ok(()),
        Err(AgentError::Shutdown) => Ok(()),
        Err(AgentError::FatalEnvironment(what)) => {
            // Exit with the dedicated code so the host restarts the service
            // against a refreshed environment.
            error!(what = %what, "Missing OS component, exiting for restart");
            std::process::exit(OperationCode::DllNotFound.value());
        }
    }
}
