//! Approval pass: decides which claimed tasks may start disrupting nodes.
//!
//! Two policies:
//!
//! - `NodeWise`: at most one task is in a processing state at any instant;
//!   the oldest claimed task goes next.
//! - `UpgradeDomainWise`: every claimed task in the current processing update
//!   domain is promoted together; other domains wait.
//!
//! Promotion to `Preparing` is a three-step sequence per task: refresh the
//! task's health policy (picking up the latest version), set the restart
//! impact and preparing health check, then write back with that version. The
//! platform drives `Preparing -> Approved` afterwards.

use std::collections::HashMap;

use pos_model::{
    ExecutorSubState, NodeInfo, NodeStatus, RepairImpact, RepairTask, ResultStatus, TaskState,
    TASK_ID_PREFIX,
};
use tracing::{info, warn};

use crate::config::TaskApprovalPolicy;
use crate::registry::{RegistryError, RepairRegistry};

/// What an approval pass did, for diagnostics and starvation tracking.
#[derive(Debug, Default)]
pub struct ApprovalOutcome {
    /// Task ids promoted to `Preparing`.
    pub promoted: Vec<String>,

    /// Task ids cancelled as orphans.
    pub orphaned: Vec<String>,

    /// Task ids skipped because their node is not `Up`.
    pub skipped_not_up: Vec<String>,

    /// Claimed tasks left after the pass.
    pub claimed_remaining: usize,

    /// Tasks in a processing state observed during the pass.
    pub processing: usize,
}

/// Run one approval pass over the coordinator's tasks.
pub async fn run_approval_pass(
    registry: &dyn RepairRegistry,
    nodes: &[NodeInfo],
    policy: TaskApprovalPolicy,
    install_on_up_nodes_only: bool,
) -> Result<ApprovalOutcome, RegistryError> {
    let mut outcome = ApprovalOutcome::default();

    let tasks = registry.list_tasks(TASK_ID_PREFIX).await?;
    let tasks: Vec<RepairTask> = tasks.into_iter().filter(|t| t.is_ours()).collect();

    let node_domains: HashMap<&str, &NodeInfo> =
        nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let processing: Vec<&RepairTask> = tasks.iter().filter(|t| t.state.is_processing()).collect();
    outcome.processing = processing.len();

    // Claimed-task selection: weed out orphans, skip nodes that are not up.
    let mut eligible: Vec<&RepairTask> = Vec::new();
    for task in tasks.iter().filter(|t| t.state == TaskState::Claimed) {
        let node = match task.target_node() {
            Some(node) => node,
            None => {
                warn!(task_id = %task.task_id, targets = task.target_nodes.len(), "Cancelling orphan task with malformed target");
                cancel_claimed(registry, task).await?;
                outcome.orphaned.push(task.task_id.clone());
                continue;
            }
        };
        let Some(info) = node_domains.get(node) else {
            warn!(task_id = %task.task_id, node, "Cancelling orphan task: node left the cluster");
            cancel_claimed(registry, task).await?;
            outcome.orphaned.push(task.task_id.clone());
            continue;
        };
        if install_on_up_nodes_only && info.status != NodeStatus::Up {
            outcome.skipped_not_up.push(task.task_id.clone());
            continue;
        }
        eligible.push(task);
    }

    match policy {
        TaskApprovalPolicy::NodeWise => {
            if processing.is_empty() {
                // The listing is creation-ordered; the head is strictly oldest.
                if let Some(task) = eligible.first() {
                    promote_to_preparing(registry, task).await?;
                    outcome.promoted.push(task.task_id.clone());
                }
            }
        }
        TaskApprovalPolicy::UpgradeDomainWise => {
            let domain_of = |task: &RepairTask| -> Option<String> {
                task.target_node()
                    .and_then(|n| node_domains.get(n))
                    .map(|info| info.update_domain.clone())
            };

            // The current processing domain wins; otherwise the domain of the
            // oldest eligible claimed task starts a new wave. Topology drift
            // can surface several processing domains mid-tick; the first
            // observed one is used and the rest are logged.
            let current_domain = processing.iter().find_map(|t| domain_of(t)).or_else(|| {
                eligible.first().and_then(|t| domain_of(t))
            });

            for task in processing.iter().skip(1) {
                if let (Some(current), Some(domain)) = (&current_domain, domain_of(task)) {
                    if domain != *current {
                        warn!(
                            task_id = %task.task_id,
                            domain,
                            current_domain = %current,
                            "Processing task outside the current update domain (topology drift)"
                        );
                    }
                }
            }

            if let Some(current) = current_domain {
                for task in &eligible {
                    if domain_of(task).as_deref() == Some(current.as_str()) {
                        promote_to_preparing(registry, task).await?;
                        outcome.promoted.push(task.task_id.clone());
                    }
                }
            }
        }
    }

    // Skipped tasks are still claimed; they count toward starvation.
    outcome.claimed_remaining = (eligible.len() + outcome.skipped_not_up.len())
        .saturating_sub(outcome.promoted.len());
    Ok(outcome)
}

/// Cancel a claimed task through the claimed-state path.
async fn cancel_claimed(
    registry: &dyn RepairRegistry,
    task: &RepairTask,
) -> Result<(), RegistryError> {
    let mut cancelled = task.clone();
    cancelled.state = TaskState::Completed;
    cancelled.result_status = ResultStatus::Cancelled;
    if let Some(data) = cancelled.executor_data.as_mut() {
        data.sub_state = ExecutorSubState::OperationAborted;
    }
    registry.update_task(cancelled).await?;
    Ok(())
}

/// The three-step promotion sequence.
async fn promote_to_preparing(
    registry: &dyn RepairRegistry,
    task: &RepairTask,
) -> Result<(), RegistryError> {
    // (a) refresh the health policy so the write below carries the newest
    // version number.
    let mut latest = registry.refresh_health_policy(&task.task_id).await?;

    // (b) declare the impact and request the preparing health check.
    let node = latest
        .target_node()
        .unwrap_or_default()
        .to_string();
    latest.impact = Some(RepairImpact::NodeRestart {
        node_name: node.clone(),
    });
    latest.perform_preparing_health_check = true;
    latest.state = TaskState::Preparing;

    // (c) write back with the version from (a).
    registry.update_task(latest).await?;
    info!(task_id = %task.task_id, node = %node, "Promoted task to Preparing");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRepairRegistry;
    use chrono::{Duration, Utc};
    use pos_model::ExecutorData;

    async fn seed_claimed(registry: &MemoryRepairRegistry, node: &str, age_minutes: i64) -> String {
        let data = ExecutorData::new(ExecutorSubState::DownloadCompleted, 90);
        let task = RepairTask::claimed(node, data, Utc::now() - Duration::minutes(age_minutes));
        registry.create_task(task).await.unwrap().task_id
    }

    async fn state_of(registry: &MemoryRepairRegistry, task_id: &str) -> TaskState {
        registry
            .list_tasks(TASK_ID_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_id == task_id)
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn test_node_wise_promotes_oldest_only() {
        let registry = MemoryRepairRegistry::new();
        let newer = seed_claimed(&registry, "n1", 5).await;
        let older = seed_claimed(&registry, "n2", 10).await;
        let nodes = vec![NodeInfo::up("n1", "0"), NodeInfo::up("n2", "1")];

        let outcome =
            run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
                .await
                .unwrap();

        assert_eq!(outcome.promoted, vec![older.clone()]);
        assert_eq!(state_of(&registry, &older).await, TaskState::Preparing);
        assert_eq!(state_of(&registry, &newer).await, TaskState::Claimed);
    }

    #[tokio::test]
    async fn test_node_wise_blocked_while_processing() {
        let registry = MemoryRepairRegistry::new();
        let processing = seed_claimed(&registry, "n1", 10).await;
        let claimed = seed_claimed(&registry, "n2", 5).await;
        let nodes = vec![NodeInfo::up("n1", "0"), NodeInfo::up("n2", "1")];

        // First pass promotes n1.
        run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();
        assert_eq!(state_of(&registry, &processing).await, TaskState::Preparing);

        // Second pass sees a processing task and holds.
        let outcome = run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();
        assert!(outcome.promoted.is_empty());
        assert_eq!(outcome.processing, 1);
        assert_eq!(state_of(&registry, &claimed).await, TaskState::Claimed);
    }

    #[tokio::test]
    async fn test_promotion_sets_impact_and_health_check() {
        let registry = MemoryRepairRegistry::new();
        let task_id = seed_claimed(&registry, "n1", 5).await;
        let nodes = vec![NodeInfo::up("n1", "0")];

        run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();

        let task = registry
            .list_tasks(TASK_ID_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.task_id == task_id)
            .unwrap();
        assert_eq!(
            task.impact,
            Some(RepairImpact::NodeRestart {
                node_name: "n1".to_string()
            })
        );
        assert!(task.perform_preparing_health_check);
    }

    #[tokio::test]
    async fn test_ud_wise_fans_out_one_domain() {
        let registry = MemoryRepairRegistry::new();
        let mut ud0 = Vec::new();
        let mut ud1 = Vec::new();
        for (i, node) in ["a1", "a2", "a3"].iter().enumerate() {
            ud0.push(seed_claimed(&registry, node, 30 - i as i64).await);
        }
        for (i, node) in ["b1", "b2", "b3"].iter().enumerate() {
            ud1.push(seed_claimed(&registry, node, 10 - i as i64).await);
        }
        let nodes = vec![
            NodeInfo::up("a1", "0"),
            NodeInfo::up("a2", "0"),
            NodeInfo::up("a3", "0"),
            NodeInfo::up("b1", "1"),
            NodeInfo::up("b2", "1"),
            NodeInfo::up("b3", "1"),
        ];

        let outcome =
            run_approval_pass(&registry, &nodes, TaskApprovalPolicy::UpgradeDomainWise, true)
                .await
                .unwrap();

        // All of UD 0 promoted in one pass; UD 1 untouched.
        assert_eq!(outcome.promoted.len(), 3);
        for id in &ud0 {
            assert_eq!(state_of(&registry, id).await, TaskState::Preparing);
        }
        for id in &ud1 {
            assert_eq!(state_of(&registry, id).await, TaskState::Claimed);
        }

        // While UD 0 is processing, UD 1 stays claimed.
        let outcome =
            run_approval_pass(&registry, &nodes, TaskApprovalPolicy::UpgradeDomainWise, true)
                .await
                .unwrap();
        assert!(outcome.promoted.is_empty());
        for id in &ud1 {
            assert_eq!(state_of(&registry, id).await, TaskState::Claimed);
        }
    }

    #[tokio::test]
    async fn test_ud_wise_late_claim_joins_current_domain() {
        let registry = MemoryRepairRegistry::new();
        let first = seed_claimed(&registry, "a1", 30).await;
        let nodes = vec![NodeInfo::up("a1", "0"), NodeInfo::up("a2", "0")];

        run_approval_pass(&registry, &nodes, TaskApprovalPolicy::UpgradeDomainWise, true)
            .await
            .unwrap();
        assert_eq!(state_of(&registry, &first).await, TaskState::Preparing);

        // A task claimed later in the same domain joins the wave.
        let late = seed_claimed(&registry, "a2", 1).await;
        run_approval_pass(&registry, &nodes, TaskApprovalPolicy::UpgradeDomainWise, true)
            .await
            .unwrap();
        assert_eq!(state_of(&registry, &late).await, TaskState::Preparing);
    }

    #[tokio::test]
    async fn test_orphan_node_cancelled() {
        let registry = MemoryRepairRegistry::new();
        let orphan = seed_claimed(&registry, "gone", 10).await;
        let live = seed_claimed(&registry, "n1", 5).await;
        let nodes = vec![NodeInfo::up("n1", "0")];

        let outcome = run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();

        assert_eq!(outcome.orphaned, vec![orphan.clone()]);
        assert_eq!(state_of(&registry, &orphan).await, TaskState::Completed);
        assert_eq!(state_of(&registry, &live).await, TaskState::Preparing);
    }

    #[tokio::test]
    async fn test_multi_node_target_cancelled() {
        let registry = MemoryRepairRegistry::new();
        let data = ExecutorData::new(ExecutorSubState::DownloadCompleted, 90);
        let mut task = RepairTask::claimed("n1", data, Utc::now());
        task.target_nodes.push("n2".to_string());
        let task_id = registry.create_task(task).await.unwrap().task_id;
        let nodes = vec![NodeInfo::up("n1", "0"), NodeInfo::up("n2", "0")];

        let outcome = run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();
        assert_eq!(outcome.orphaned, vec![task_id]);
    }

    #[tokio::test]
    async fn test_down_node_skipped_not_cancelled() {
        let registry = MemoryRepairRegistry::new();
        let task_id = seed_claimed(&registry, "n1", 10).await;
        let nodes = vec![NodeInfo {
            name: "n1".to_string(),
            status: NodeStatus::Down,
            update_domain: "0".to_string(),
        }];

        let outcome = run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, true)
            .await
            .unwrap();

        assert_eq!(outcome.skipped_not_up, vec![task_id.clone()]);
        assert!(outcome.promoted.is_empty());
        assert_eq!(state_of(&registry, &task_id).await, TaskState::Claimed);

        // With the gate off, a down node may still be patched.
        let outcome = run_approval_pass(&registry, &nodes, TaskApprovalPolicy::NodeWise, false)
            .await
            .unwrap();
        assert_eq!(outcome.promoted, vec![task_id]);
    }
}
