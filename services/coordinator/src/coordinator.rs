//! The repair coordinator control loop.
//!
//! Runs on a single primary at a fixed polling interval. Every decision is
//! re-derived from the repair registry and node list each tick; the
//! coordinator persists no process-local state, so recovery after failover is
//! identical to normal operation.

use std::sync::Arc;

use chrono::Utc;
use pos_model::{HealthReport, HealthState, TaskState, TASK_ID_PREFIX};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::approval::run_approval_pass;
use crate::cluster::ClusterQuery;
use crate::config::Config;
use crate::healthbus::HealthBus;
use crate::ops::NodeStatusBoard;
use crate::registry::RepairRegistry;
use crate::results::ResultStore;
use crate::timeout::run_timeout_pass;

/// Consecutive starved ticks before the coordinator raises a warning.
const STARVATION_TICK_THRESHOLD: u32 = 60;

/// The cluster-level repair coordinator.
pub struct RepairCoordinator {
    registry: Arc<dyn RepairRegistry>,
    cluster: Arc<dyn ClusterQuery>,
    health: Arc<dyn HealthBus>,
    results: Arc<ResultStore>,
    status_board: Arc<NodeStatusBoard>,
    config: Config,

    /// Ticks in a row with claimed tasks but nothing processing.
    starved_ticks: u32,

    /// Last tick at which a processing task was observed, for the
    /// between-nodes cool-down.
    last_processing_seen: Option<chrono::DateTime<Utc>>,
}

impl RepairCoordinator {
    pub fn new(
        registry: Arc<dyn RepairRegistry>,
        cluster: Arc<dyn ClusterQuery>,
        health: Arc<dyn HealthBus>,
        results: Arc<ResultStore>,
        status_board: Arc<NodeStatusBoard>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            cluster,
            health,
            results,
            status_board,
            config,
            starved_ticks: 0,
            last_processing_seen: None,
        }
    }

    /// Run the control loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.polling_frequency.as_secs(),
            policy = ?self.config.task_approval_policy,
            "Starting repair coordinator"
        );

        let mut interval = tokio::time::interval(self.config.polling_frequency);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        // Transient platform errors surface here; the whole
                        // tick is retried on the next interval.
                        error!(error = %e, "Coordinator tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Repair coordinator shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single coordinator tick.
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        let now = Utc::now();
        let ttl = (self.config.polling_frequency.as_secs() as i64) * 2;

        // 1. Platform readiness.
        if !self.registry.is_available().await {
            warn!("Repair registry service not present, skipping tick");
            self.publish(
                "RepairManagerStatus",
                "The repair registry service is not present in the cluster; patch coordination is paused.",
                HealthState::Warning,
                None,
            )
            .await;
            return Ok(());
        }
        self.publish(
            "RepairManagerStatus",
            "Repair registry reachable.",
            HealthState::Ok,
            Some(ttl),
        )
        .await;

        // 2. Diagnostic dump.
        let tasks = self.registry.list_tasks(TASK_ID_PREFIX).await?;
        for task in &tasks {
            info!(
                task_id = %task.task_id,
                state = %task.state,
                sub_state = %task.sub_state(),
                target = task.target_node().unwrap_or("<invalid>"),
                "Repair task"
            );
        }

        let nodes = self.cluster.list_nodes().await?;

        // 3. Approval pass, unless we are still inside the cool-down window
        // between nodes.
        let in_cooldown = !self.config.min_wait_time_between_nodes.is_zero()
            && self.last_processing_seen.is_some_and(|seen| {
                now - seen
                    < chrono::Duration::seconds(
                        self.config.min_wait_time_between_nodes.as_secs() as i64
                    )
            })
            && !tasks.iter().any(|t| t.state.is_processing());

        let outcome = if in_cooldown {
            info!("Holding approvals during the between-nodes cool-down");
            None
        } else {
            Some(
                run_approval_pass(
                    self.registry.as_ref(),
                    &nodes,
                    self.config.task_approval_policy,
                    self.config.install_on_up_nodes_only,
                )
                .await?,
            )
        };

        // 4. Timeout pass.
        if self.config.manage_repair_tasks_on_timeout {
            let timeouts = run_timeout_pass(
                self.registry.as_ref(),
                self.config.grace_time_for_nt_service,
                now,
            )
            .await?;
            for slow in &timeouts.slow_post_install {
                self.publish(
                    &format!("SlowInstallation-{}", slow.node),
                    &format!(
                        "Node {} finished installing {} minutes ago (sub-state {}) but has not completed its operation yet.",
                        slow.node, slow.elapsed_minutes, slow.sub_state
                    ),
                    HealthState::Warning,
                    Some(ttl),
                )
                .await;
            }
        }

        // 5. Result-store trim.
        let trimmed = self.results.trim()?;
        if trimmed > 0 {
            info!(trimmed, "Trimmed result store to its bound");
        }

        // 6. Patching-status publication, from a fresh listing so this tick's
        // own promotions and cancellations are visible.
        let tasks = self.registry.list_tasks(TASK_ID_PREFIX).await?;
        let claimed: Vec<&str> = tasks
            .iter()
            .filter(|t| t.state == TaskState::Claimed)
            .filter_map(|t| t.target_node())
            .collect();
        let processing: Vec<&str> = tasks
            .iter()
            .filter(|t| t.state.is_processing())
            .filter_map(|t| t.target_node())
            .collect();

        if !processing.is_empty() {
            self.last_processing_seen = Some(now);
        }

        self.publish(
            "RMTaskUpdate",
            &format!("claimed: [{}]; processing: [{}]", claimed.join(", "), processing.join(", ")),
            HealthState::Ok,
            Some(ttl),
        )
        .await;

        let known: std::collections::HashSet<&str> =
            nodes.iter().map(|n| n.name.as_str()).collect();
        for (node, description) in self.status_board.snapshot() {
            if known.contains(node.as_str()) {
                self.publish(
                    &format!("WUOperationStatusUpdate-{node}"),
                    &description,
                    HealthState::Ok,
                    Some(ttl),
                )
                .await;
            } else {
                // The node left the cluster; drop the entry and let the
                // published fact age out by TTL.
                info!(node = %node, "Expiring patching-status fact for departed node");
                self.status_board.remove(&node);
            }
        }

        // Starvation diagnostics.
        if let Some(outcome) = &outcome {
            let starving = outcome.claimed_remaining > 0
                && outcome.processing == 0
                && outcome.promoted.is_empty();
            self.starved_ticks = if starving { self.starved_ticks + 1 } else { 0 };
            if self.starved_ticks >= STARVATION_TICK_THRESHOLD {
                let cluster_health = self.cluster.cluster_health().await?;
                let description = if cluster_health == HealthState::Ok {
                    "Claimed patch tasks have not been approved for a long time although the \
                     cluster is healthy; check the repair task approval configuration."
                } else {
                    "Claimed patch tasks are on hold because the cluster is unhealthy; patching \
                     resumes when the cluster recovers."
                };
                self.publish("PendingTasksStarved", description, HealthState::Warning, Some(ttl))
                    .await;
            }
        }

        Ok(())
    }

    /// Publish a fact against the coordinator's own service. Failures are
    /// logged, never fatal for the tick.
    async fn publish(&self, property: &str, description: &str, state: HealthState, ttl: Option<i64>) {
        let report = HealthReport::new(
            self.config.coordinator_service_uri.clone(),
            property,
            description,
            state,
            ttl,
        );
        if let Err(e) = self.health.publish(report).await {
            warn!(property, error = %e, "Failed to publish coordinator health fact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::healthbus::MemoryHealthBus;
    use crate::registry::MemoryRepairRegistry;
    use pos_model::{ExecutorData, ExecutorSubState, NodeInfo, RepairTask};

    fn coordinator_with(
        registry: Arc<MemoryRepairRegistry>,
        cluster: Arc<MemoryCluster>,
        health: Arc<MemoryHealthBus>,
    ) -> RepairCoordinator {
        RepairCoordinator::new(
            registry,
            cluster,
            health,
            Arc::new(ResultStore::open_in_memory(100).unwrap()),
            Arc::new(NodeStatusBoard::new()),
            Config::default(),
        )
    }

    #[tokio::test]
    async fn test_tick_skips_when_registry_absent() {
        let registry = Arc::new(MemoryRepairRegistry::new());
        registry.set_available(false);
        let health = Arc::new(MemoryHealthBus::new());
        let mut coordinator = coordinator_with(
            registry,
            Arc::new(MemoryCluster::new(vec![])),
            health.clone(),
        );

        coordinator.tick().await.unwrap();

        let fact = health
            .fact("fabric:/PatchOrchestration/Coordinator", "RepairManagerStatus")
            .unwrap();
        assert_eq!(fact.state, HealthState::Warning);
    }

    #[tokio::test]
    async fn test_tick_promotes_and_publishes_status() {
        let registry = Arc::new(MemoryRepairRegistry::new());
        let data = ExecutorData::new(ExecutorSubState::DownloadCompleted, 90);
        registry
            .create_task(RepairTask::claimed("n1", data, Utc::now()))
            .await
            .unwrap();

        let cluster = Arc::new(MemoryCluster::new(vec![NodeInfo::up("n1", "0")]));
        let health = Arc::new(MemoryHealthBus::new());
        let mut coordinator = coordinator_with(registry.clone(), cluster, health.clone());

        coordinator.tick().await.unwrap();

        let task = registry.list_tasks(TASK_ID_PREFIX).await.unwrap().remove(0);
        assert_eq!(task.state, TaskState::Preparing);

        let fact = health
            .fact("fabric:/PatchOrchestration/Coordinator", "RMTaskUpdate")
            .unwrap();
        assert!(fact.description.contains("processing: [n1]"));
    }

    #[tokio::test]
    async fn test_starvation_warning_wording_tracks_cluster_health() {
        let registry = Arc::new(MemoryRepairRegistry::new());
        let data = ExecutorData::new(ExecutorSubState::DownloadCompleted, 90);
        registry
            .create_task(RepairTask::claimed("n1", data, Utc::now()))
            .await
            .unwrap();

        // Down node with the up-nodes-only gate keeps the task claimed forever.
        let cluster = Arc::new(MemoryCluster::new(vec![NodeInfo {
            name: "n1".to_string(),
            status: pos_model::NodeStatus::Down,
            update_domain: "0".to_string(),
        }]));
        cluster.set_health(HealthState::Error);
        let health = Arc::new(MemoryHealthBus::new());
        let mut coordinator = coordinator_with(registry, cluster, health.clone());

        for _ in 0..STARVATION_TICK_THRESHOLD {
            coordinator.tick().await.unwrap();
        }

        let fact = health
            .fact("fabric:/PatchOrchestration/Coordinator", "PendingTasksStarved")
            .unwrap();
        assert_eq!(fact.state, HealthState::Warning);
        assert!(fact.description.contains("unhealthy"));
    }

    #[tokio::test]
    async fn test_status_board_orphan_removed() {
        let registry = Arc::new(MemoryRepairRegistry::new());
        let cluster = Arc::new(MemoryCluster::new(vec![NodeInfo::up("n1", "0")]));
        let health = Arc::new(MemoryHealthBus::new());
        let board = Arc::new(NodeStatusBoard::new());
        board.record("n1", "last reported operation state: None".to_string());
        board.record("gone", "last reported operation state: None".to_string());

        let mut coordinator = RepairCoordinator::new(
            registry,
            cluster,
            health.clone(),
            Arc::new(ResultStore::open_in_memory(100).unwrap()),
            board.clone(),
            Config::default(),
        );
        coordinator.tick().await.unwrap();

        assert!(health
            .fact("fabric:/PatchOrchestration/Coordinator", "WUOperationStatusUpdate-n1")
            .is_some());
        assert!(health
            .fact("fabric:/PatchOrchestration/Coordinator", "WUOperationStatusUpdate-gone")
            .is_none());
        assert!(!board.snapshot().contains_key("gone"));
    }
}
