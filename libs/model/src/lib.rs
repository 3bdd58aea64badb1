//! Shared data model for the patch orchestration service.
//!
//! This library defines the types that cross process boundaries:
//!
//! - Repair tasks and their cluster-scoped state machine
//! - The agent's nested sub-state machine stored in executor data
//! - The numeric operation contract shared by the coordinator RPC surface
//!   and the agent-side helper's exit codes
//! - Operation results recorded in the result store
//! - Health facts published against platform services
//!
//! # Invariants
//!
//! - Numeric codes are bit-exact and never renumbered
//! - Sub-state advancement is monotone except the `OperationAborted` terminal
//! - Every task created by this system carries executor `POS` and a task id
//!   prefixed `POS_<nodeName>_`

pub mod codes;
pub mod error;
pub mod health;
pub mod node;
pub mod results;
pub mod rpc;
pub mod substate;
pub mod task;

pub use codes::OperationCode;
pub use error::ModelError;
pub use health::{HealthReport, HealthState};
pub use node::{NodeInfo, NodeStatus};
pub use results::{OperationResult, OperationType, UpdateDetail, UpdateOperationOutcome};
pub use rpc::{
    ApplicationDeployedStatus, ExecutorDataForNtService, OperationStateResponse, ReportHealthRequest,
    RpcFailure, UpdateInstallationRequest, UpdateSearchAndDownloadRequest,
};
pub use substate::ExecutorSubState;
pub use task::{ExecutorData, RepairImpact, RepairTask, ResultStatus, TaskState};

/// Executor literal identifying this system on repair tasks.
pub const EXECUTOR_NAME: &str = "POS";

/// Prefix used when listing repair tasks owned by this system.
pub const TASK_ID_PREFIX: &str = "POS";

/// Fixed category GUID implied by `InstallWindowsOSOnlyUpdates`.
pub const OS_UPDATES_CATEGORY_ID: &str = "6964aab4-c5b5-43bd-a17d-ffb4346a8e1d";
