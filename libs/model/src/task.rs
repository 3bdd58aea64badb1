//! Repair task record and the cluster-scoped portion of the state machine.
//!
//! The platform repair registry owns the durable record and the transitions
//! `Preparing -> Approved` and `Executing -> Restoring` on health timeout.
//! This system owns the executor data blob and every transition it performs
//! goes through the registry's optimistic-concurrency API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;
use crate::substate::ExecutorSubState;
use crate::{EXECUTOR_NAME, TASK_ID_PREFIX};

/// Platform-defined repair task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Claimed,
    Preparing,
    Approved,
    Executing,
    Restoring,
    Completed,
}

impl TaskState {
    /// A task in any state but `Completed` counts against the one-active-task
    /// per node invariant.
    pub fn is_active(self) -> bool {
        self != Self::Completed
    }

    /// States in which the node is (about to be) disrupted. The approval
    /// policies count these when deciding what else may proceed.
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Approved | Self::Executing | Self::Restoring
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Claimed => "Claimed",
            Self::Preparing => "Preparing",
            Self::Approved => "Approved",
            Self::Executing => "Executing",
            Self::Restoring => "Restoring",
            Self::Completed => "Completed",
        };
        write!(f, "{}", name)
    }
}

/// Final result recorded on a repair task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Succeeded,
    Cancelled,
    Failed,
}

/// Impact declared when promoting a task to `Preparing`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RepairImpact {
    /// The named node will be disabled and restarted.
    NodeRestart { node_name: String },
}

/// Executor-owned blob stored on the repair task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorData {
    /// The agent's nested state.
    pub sub_state: ExecutorSubState,

    /// Per-task installation budget in minutes.
    pub timeout_minutes: i64,

    /// Set when a restart is requested; compared against system boot time to
    /// detect that the reboot actually happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_requested_at: Option<DateTime<Utc>>,
}

impl ExecutorData {
    /// Fresh executor data for a newly claimed task.
    pub fn new(sub_state: ExecutorSubState, timeout_minutes: i64) -> Self {
        Self {
            sub_state,
            timeout_minutes,
            restart_requested_at: None,
        }
    }

    /// Serialize to the opaque blob form stored by the registry.
    pub fn to_blob(&self) -> String {
        // ExecutorData is plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse the opaque blob form.
    pub fn from_blob(blob: &str) -> Result<Self, ModelError> {
        serde_json::from_str(blob).map_err(|e| ModelError::InvalidExecutorData(e.to_string()))
    }
}

/// Durable repair task record.
///
/// `version` is the registry's optimistic-concurrency token; every write must
/// carry the version read in the same tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairTask {
    pub task_id: String,

    /// Target node names. Exactly one entry is valid; anything else is
    /// orphan-cancelled by the coordinator.
    pub target_nodes: Vec<String>,

    pub state: TaskState,
    pub result_status: ResultStatus,

    /// Executor literal; tasks with a different executor are ignored.
    pub executor: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_data: Option<ExecutorData>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<RepairImpact>,

    pub perform_preparing_health_check: bool,

    pub created_at: DateTime<Utc>,

    /// Set by the platform on entry to `Approved`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,

    pub version: u64,
}

impl RepairTask {
    /// Build a freshly claimed task for `node` with the given executor data.
    pub fn claimed(node: &str, executor_data: ExecutorData, now: DateTime<Utc>) -> Self {
        Self {
            task_id: new_task_id(node),
            target_nodes: vec![node.to_string()],
            state: TaskState::Claimed,
            result_status: ResultStatus::Pending,
            executor: EXECUTOR_NAME.to_string(),
            executor_data: Some(executor_data),
            impact: None,
            perform_preparing_health_check: false,
            created_at: now,
            approved_at: None,
            version: 0,
        }
    }

    /// The single target node, if the task is well-formed.
    pub fn target_node(&self) -> Option<&str> {
        match self.target_nodes.as_slice() {
            [node] => Some(node.as_str()),
            _ => None,
        }
    }

    /// Whether this task belongs to this system.
    pub fn is_ours(&self) -> bool {
        self.executor == EXECUTOR_NAME && self.task_id.starts_with(TASK_ID_PREFIX)
    }

    /// Sub-state stored in executor data, defaulting to `None`.
    pub fn sub_state(&self) -> ExecutorSubState {
        self.executor_data
            .as_ref()
            .map(|d| d.sub_state)
            .unwrap_or(ExecutorSubState::None)
    }
}

/// Construct a task id: `POS_<nodeName>_<uuid>`.
pub fn new_task_id(node: &str) -> String {
    format!("{}_{}_{}", TASK_ID_PREFIX, node, Uuid::new_v4())
}

/// Listing prefix for tasks targeting `node`.
pub fn node_task_prefix(node: &str) -> String {
    format!("{}_{}_", TASK_ID_PREFIX, node)
}

/// Extract the node name out of a task id.
pub fn node_from_task_id(task_id: &str) -> Result<&str, ModelError> {
    let rest = task_id
        .strip_prefix(TASK_ID_PREFIX)
        .and_then(|r| r.strip_prefix('_'))
        .ok_or_else(|| ModelError::MalformedTaskId(task_id.to_string()))?;
    let node = rest
        .rsplit_once('_')
        .map(|(node, _uuid)| node)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ModelError::MalformedTaskId(task_id.to_string()))?;
    Ok(node)
}
