//! Patch orchestration coordinator.
//!
//! Singleton control service that approves per-node repair tasks by policy,
//! enforces installation timeouts, keeps the result history bounded, and
//! serves the agent-facing RPC surface plus the read-only results endpoint.

use std::sync::Arc;

use anyhow::Result;
use pos_model::{NodeInfo, NodeStatus};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pos_coordinator::api;
use pos_coordinator::cluster::MemoryCluster;
use pos_coordinator::config::Config;
use pos_coordinator::coordinator::RepairCoordinator;
use pos_coordinator::healthbus::MemoryHealthBus;
use pos_coordinator::ops::{CoordinatorOps, NodeStatusBoard};
use pos_coordinator::registry::MemoryRepairRegistry;
use pos_coordinator::results::ResultStore;
use pos_coordinator::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting patch orchestration coordinator");

    let config = Config::from_env()?;
    info!(listen_addr = %config.listen_addr, policy = ?config.task_approval_policy, "Configuration loaded");

    let results = match ResultStore::open(&config.result_store_path, config.max_results_to_cache) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(path = %config.result_store_path, error = %e, "Failed to open result store");
            return Err(e.into());
        }
    };

    // Platform adapters. The in-memory implementations serve the
    // single-process loop; a platform deployment swaps these for its own.
    let registry = Arc::new(MemoryRepairRegistry::new());
    let cluster = Arc::new(MemoryCluster::new(nodes_from_env()?));
    cluster.add_service(&config.coordinator_service_uri);
    let health = Arc::new(MemoryHealthBus::new());
    let status_board = Arc::new(NodeStatusBoard::new());

    let ops = Arc::new(CoordinatorOps::new(
        registry.clone(),
        cluster.clone(),
        health.clone(),
        results.clone(),
        status_board.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut coordinator = RepairCoordinator::new(
        registry,
        cluster,
        health,
        results,
        status_board,
        config.clone(),
    );
    let coordinator_handle = tokio::spawn(async move { coordinator.run(shutdown_rx).await });

    let app = api::create_router(AppState::new(ops));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    coordinator_handle.await?;

    Ok(())
}

/// Parse the static node list from `POS_CLUSTER_NODES` (`name:ud,...`).
fn nodes_from_env() -> Result<Vec<NodeInfo>> {
    let raw = match std::env::var("POS_CLUSTER_NODES") {
        Ok(raw) => raw,
        Err(_) => return Ok(Vec::new()),
    };

    let mut nodes = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, update_domain) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("POS_CLUSTER_NODES entry '{entry}' is not name:ud"))?;
        nodes.push(NodeInfo {
            name: name.to_string(),
            status: NodeStatus::Up,
            update_domain: update_domain.to_string(),
        });
    }
    Ok(nodes)
}
