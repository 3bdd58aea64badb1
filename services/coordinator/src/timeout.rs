//! Timeout pass: reclaims nodes whose installation overran its budget.
//!
//! A task sits in `Approved | Executing` from platform approval until the
//! agent finishes. If it overstays `ExecutorTimeoutInMinutes` plus the
//! service grace period, the pass cancels it into `Restoring` so the next
//! node can be approved. Post-install states are exempt: the disruptive work
//! already happened and cancelling would only lose the record, so those just
//! produce a warning.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pos_model::{ExecutorSubState, ResultStatus, TaskState, TASK_ID_PREFIX};
use tracing::{info, warn};

use crate::registry::{RegistryError, RepairRegistry};

/// A task progressing slowly after its install finished.
#[derive(Debug, Clone)]
pub struct SlowPostInstall {
    pub task_id: String,
    pub node: String,
    pub sub_state: ExecutorSubState,
    pub elapsed_minutes: i64,
}

/// What a timeout pass did.
#[derive(Debug, Default)]
pub struct TimeoutOutcome {
    /// Task ids moved to `Restoring/Cancelled`.
    pub cancelled: Vec<String>,

    /// Tasks past their budget but left alone because the install completed.
    pub slow_post_install: Vec<SlowPostInstall>,
}

/// Run one timeout pass.
pub async fn run_timeout_pass(
    registry: &dyn RepairRegistry,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<TimeoutOutcome, RegistryError> {
    let mut outcome = TimeoutOutcome::default();

    let tasks = registry.list_tasks(TASK_ID_PREFIX).await?;
    for task in tasks {
        if !task.is_ours()
            || !matches!(task.state, TaskState::Approved | TaskState::Executing)
        {
            continue;
        }
        let Some(approved_at) = task.approved_at else {
            continue;
        };

        let elapsed = now - approved_at;
        let timeout_minutes = task
            .executor_data
            .as_ref()
            .map(|d| d.timeout_minutes)
            .unwrap_or(0);
        let budget = chrono::Duration::minutes(timeout_minutes)
            + chrono::Duration::seconds(grace.as_secs() as i64);
        if elapsed <= budget {
            continue;
        }

        let node = task.target_node().unwrap_or_default().to_string();
        let sub_state = task.sub_state();

        if sub_state.is_post_install() {
            warn!(
                task_id = %task.task_id,
                node = %node,
                sub_state = %sub_state,
                elapsed_minutes = elapsed.num_minutes(),
                "Installation finished but post-install progress is slow"
            );
            outcome.slow_post_install.push(SlowPostInstall {
                task_id: task.task_id.clone(),
                node,
                sub_state,
                elapsed_minutes: elapsed.num_minutes(),
            });
            continue;
        }

        let mut cancelled = task.clone();
        cancelled.state = TaskState::Restoring;
        cancelled.result_status = ResultStatus::Cancelled;
        registry.update_task(cancelled).await?;
        info!(
            task_id = %task.task_id,
            node = %node,
            sub_state = %sub_state,
            elapsed_minutes = elapsed.num_minutes(),
            budget_minutes = budget.num_minutes(),
            "Cancelled overrunning task to unblock the next node"
        );
        outcome.cancelled.push(task.task_id);
    }

    Ok(outcome)
}
