//! The six coordinator-agent operations.
//!
//! Each operation reads and advances cluster-side repair-task state so the
//! agent's nested state machine and the task state machine stay jointly
//! consistent. All transitions are idempotent given the same input state, and
//! every failure maps onto the frozen numeric contract at the process
//! boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pos_model::{
    task, ApplicationDeployedStatus, ExecutorData, ExecutorDataForNtService, ExecutorSubState,
    ModelError, OperationCode, OperationResult, OperationStateResponse, RepairTask,
    ReportHealthRequest, ResultStatus, TaskState, UpdateInstallationRequest,
    UpdateSearchAndDownloadRequest,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::{ClusterError, ClusterQuery};
use crate::config::Config;
use crate::healthbus::{publish_when_ready, HealthBus, HealthBusError};
use crate::registry::{RegistryError, RepairRegistry};
use crate::results::{ResultStore, ResultStoreError};

/// Errors from the operation layer, each carrying a contract code.
#[derive(Debug, Error)]
pub enum OpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no active repair task for node {0}")]
    NoActiveTask(String),

    #[error("unexpected repair task state {state} on {task_id}")]
    InvalidTaskState { task_id: String, state: TaskState },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    HealthBus(#[from] HealthBusError),

    #[error(transparent)]
    ResultStore(#[from] ResultStoreError),

    #[error("operation deadline of {0:?} expired")]
    Deadline(Duration),
}

impl OpError {
    /// Numeric contract code for this failure.
    pub fn code(&self) -> OperationCode {
        match self {
            Self::InvalidArgument(_) => OperationCode::InvalidArgument,
            Self::NoActiveTask(_) | Self::InvalidTaskState { .. } | Self::Model(_) => {
                OperationCode::RepairTaskInvalidState
            }
            Self::Registry(e) if e.is_retryable() => OperationCode::RetryableException,
            Self::Registry(_) => OperationCode::Failure,
            Self::Cluster(_) => OperationCode::RetryableException,
            Self::HealthBus(HealthBusError::ServiceNotFound(_)) => OperationCode::ServiceNotFound,
            Self::HealthBus(HealthBusError::ReadinessTimeout(_)) => OperationCode::TimeoutException,
            Self::HealthBus(HealthBusError::Unavailable(_)) => OperationCode::RetryableException,
            Self::ResultStore(_) => OperationCode::Failure,
            Self::Deadline(_) => OperationCode::TimeoutException,
        }
    }
}

/// Last reported agent activity per node, published as
/// `WUOperationStatusUpdate-<node>` facts by the coordinator tick.
#[derive(Default)]
pub struct NodeStatusBoard {
    entries: Mutex<HashMap<String, String>>,
}

impl NodeStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, node: &str, description: String) {
        self.entries
            .lock()
            .expect("status board lock")
            .insert(node.to_string(), description);
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.entries.lock().expect("status board lock").clone()
    }

    pub fn remove(&self, node: &str) -> bool {
        self.entries
            .lock()
            .expect("status board lock")
            .remove(node)
            .is_some()
    }
}

/// The operation layer shared by the RPC surface and the control loop.
pub struct CoordinatorOps {
    registry: Arc<dyn RepairRegistry>,
    cluster: Arc<dyn ClusterQuery>,
    health: Arc<dyn HealthBus>,
    results: Arc<ResultStore>,
    status_board: Arc<NodeStatusBoard>,
    config: Config,
}

impl CoordinatorOps {
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
        }
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn status_board(&self) -> &NodeStatusBoard {
        &self.status_board
    }

    /// Read the node's effective sub-state from its oldest active task.
    ///
    /// When an `Executing` task says `RestartRequested` and the reported boot
    /// time proves the node rebooted, the task is first advanced to
    /// `RestartCompleted` so the caller observes the flip exactly once.
    pub async fn get_wu_operation_state(
        &self,
        node: &str,
        system_boot_time: Option<DateTime<Utc>>,
    ) -> Result<OperationStateResponse, OpError> {
        let task = self.oldest_active_task(node).await?;

        let Some(mut task) = task else {
            return Ok(OperationStateResponse {
                sub_state: ExecutorSubState::None,
                executor_data: None,
            });
        };

        let executor_data = Some(ExecutorDataForNtService {
            approved_at: task.approved_at,
            executor_timeout_minutes: task
                .executor_data
                .as_ref()
                .map(|d| d.timeout_minutes)
                .unwrap_or(0),
        });

        let sub_state = match task.state {
            TaskState::Claimed | TaskState::Preparing => ExecutorSubState::DownloadCompleted,
            TaskState::Approved => ExecutorSubState::InstallationApproved,
            TaskState::Executing => {
                let stored = task.sub_state();
                let rebooted = stored == ExecutorSubState::RestartRequested
                    && matches!(
                        (system_boot_time, task.executor_data.as_ref().and_then(|d| d.restart_requested_at)),
                        (Some(boot), Some(requested)) if boot >= requested
                    );
                if rebooted {
                    if let Some(data) = task.executor_data.as_mut() {
                        data.sub_state = ExecutorSubState::RestartCompleted;
                    }
                    let updated = self.with_deadline(self.registry.update_task(task)).await??;
                    info!(
                        node,
                        task_id = %updated.task_id,
                        "Observed node reboot, advanced sub-state to RestartCompleted"
                    );
                    ExecutorSubState::RestartCompleted
                } else {
                    stored
                }
            }
            TaskState::Restoring | TaskState::Completed => ExecutorSubState::OperationCompleted,
            other => {
                return Err(OpError::InvalidTaskState {
                    task_id: task.task_id,
                    state: other,
                })
            }
        };

        Ok(OperationStateResponse {
            sub_state,
            executor_data,
        })
    }

    /// Record the agent's search-and-download outcome.
    pub async fn update_search_and_download_status(
        &self,
        node: &str,
        req: UpdateSearchAndDownloadRequest,
    ) -> Result<(), OpError> {
        self.record_status(node, req.sub_state);

        match req.sub_state {
            ExecutorSubState::DownloadCompleted => {
                if let Some(existing) = self.oldest_active_task(node).await? {
                    // Retried call after a lost response: the task is already there.
                    if effective_sub_state(&existing) == ExecutorSubState::DownloadCompleted {
                        self.enqueue_result(req.result.as_ref())?;
                        return Ok(());
                    }
                    return Err(OpError::InvalidTaskState {
                        task_id: existing.task_id,
                        state: existing.state,
                    });
                }

                let data = ExecutorData::new(
                    ExecutorSubState::DownloadCompleted,
                    req.installation_timeout_minutes,
                );
                let task = RepairTask::claimed(node, data, Utc::now());
                let created = self.with_deadline(self.registry.create_task(task)).await??;
                info!(node, task_id = %created.task_id, "Created claimed repair task");
                self.enqueue_result(req.result.as_ref())?;
                Ok(())
            }
            ExecutorSubState::OperationCompleted => {
                // Nothing to update on the task; the cycle found no work.
                self.enqueue_result(req.result.as_ref())?;
                Ok(())
            }
            ExecutorSubState::OperationAborted => {
                let Some(mut existing) = self.oldest_active_task(node).await? else {
                    // Nothing left to abort.
                    return Ok(());
                };
                if existing.state != TaskState::Claimed {
                    return Err(OpError::InvalidTaskState {
                        task_id: existing.task_id,
                        state: existing.state,
                    });
                }
                if let Some(data) = existing.executor_data.as_mut() {
                    data.sub_state = data.sub_state.advance_to(ExecutorSubState::OperationAborted)?;
                }
                existing.state = TaskState::Completed;
                existing.result_status = ResultStatus::Failed;
                let task_id = existing.task_id.clone();
                self.with_deadline(self.registry.update_task(existing)).await??;
                warn!(node, task_id = %task_id, "Abandoned claimed repair task");
                self.enqueue_result(req.result.as_ref())?;
                Ok(())
            }
            other => Err(OpError::InvalidArgument(format!(
                "sub-state {other} is not valid for a search-and-download update"
            ))),
        }
    }

    /// Record the agent's installation progress on the current task.
    pub async fn update_installation_status(
        &self,
        node: &str,
        req: UpdateInstallationRequest,
    ) -> Result<(), OpError> {
        use ExecutorSubState::*;

        if !matches!(
            req.sub_state,
            InstallationInProgress
                | InstallationCompleted
                | RestartRequested
                | RestartNotNeeded
                | RestartCompleted
                | OperationCompleted
        ) {
            return Err(OpError::InvalidArgument(format!(
                "sub-state {} is not valid for an installation update",
                req.sub_state
            )));
        }

        self.record_status(node, req.sub_state);

        let mut task = self
            .oldest_active_task(node)
            .await?
            .ok_or_else(|| OpError::NoActiveTask(node.to_string()))?;

        let current = effective_sub_state(&task);
        if current == req.sub_state {
            // Retried call after a lost response.
            self.enqueue_result(req.result.as_ref())?;
            return Ok(());
        }
        current.advance_to(req.sub_state)?;

        let data = task
            .executor_data
            .get_or_insert_with(|| ExecutorData::new(ExecutorSubState::None, 0));
        data.sub_state = req.sub_state;
        if req.sub_state == RestartRequested {
            data.restart_requested_at = Some(Utc::now());
        }

        match req.sub_state {
            InstallationInProgress => {
                // The executor takes over once installation starts.
                task.state = TaskState::Executing;
            }
            OperationCompleted => {
                task.state = TaskState::Restoring;
                task.result_status = ResultStatus::Succeeded;
            }
            _ => {}
        }

        let task_id = task.task_id.clone();
        self.with_deadline(self.registry.update_task(task)).await??;
        info!(node, task_id = %task_id, sub_state = %req.sub_state, "Installation status updated");
        self.enqueue_result(req.result.as_ref())?;
        Ok(())
    }

    /// Enqueue a standalone operation result.
    pub fn update_wu_operation_result(&self, result: OperationResult) -> Result<(), OpError> {
        self.results.enqueue(&result)?;
        Ok(())
    }

    /// Publish a health fact once the target service exists.
    pub async fn report_health(&self, req: ReportHealthRequest) -> Result<(), OpError> {
        let deadline = req
            .readiness_deadline_seconds
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(self.config.default_operation_timeout);

        let report = pos_model::HealthReport::new(
            req.application_uri,
            req.property,
            req.description,
            req.state,
            req.ttl_seconds,
        );
        publish_when_ready(self.cluster.as_ref(), self.health.as_ref(), report, deadline).await?;
        Ok(())
    }

    /// Whether an application is deployed.
    pub async fn get_application_deployed_status(
        &self,
        application_uri: &str,
    ) -> Result<ApplicationDeployedStatus, OpError> {
        if application_uri.is_empty() {
            return Err(OpError::InvalidArgument("empty application uri".to_string()));
        }
        let exists = self.cluster.application_exists(application_uri).await?;
        Ok(if exists {
            ApplicationDeployedStatus::Deployed
        } else {
            ApplicationDeployedStatus::NotFound
        })
    }

    /// Oldest active task owned by this system targeting `node`.
    async fn oldest_active_task(&self, node: &str) -> Result<Option<RepairTask>, OpError> {
        let prefix = task::node_task_prefix(node);
        let tasks = self.with_deadline(self.registry.list_tasks(&prefix)).await??;
        // The registry returns creation order; the first active one is oldest.
        Ok(tasks
            .into_iter()
            .find(|t| t.is_ours() && t.state.is_active()))
    }

    fn enqueue_result(&self, result: Option<&OperationResult>) -> Result<(), OpError> {
        if let Some(result) = result {
            self.results.enqueue(result)?;
        }
        Ok(())
    }

    fn record_status(&self, node: &str, sub_state: ExecutorSubState) {
        self.status_board
            .record(node, format!("last reported operation state: {sub_state}"));
    }

    async fn with_deadline<T, E>(
        &self,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<Result<T, E>, OpError> {
        tokio::time::timeout(self.config.default_operation_timeout, fut)
            .await
            .map_err(|_| OpError::Deadline(self.config.default_operation_timeout))
    }
}

/// The sub-state a caller observes for a task, derived jointly from the task
/// state and the stored executor data.
pub fn effective_sub_state(task: &RepairTask) -> ExecutorSubState {
    match task.state {
        TaskState::Claimed | TaskState::Preparing => ExecutorSubState::DownloadCompleted,
        TaskState::Approved => ExecutorSubState::InstallationApproved,
        TaskState::Executing => task.sub_state(),
        TaskState::Restoring | TaskState::Completed => ExecutorSubState::OperationCompleted,
        TaskState::Created => ExecutorSubState::None,
    }
}
