//! Wire payloads of the coordinator-agent RPC operations.
//!
//! Six operations keep the cluster-side and node-side state machines
//! consistent. The JSON shapes here are the request/response bodies; failures
//! travel as [`RpcFailure`] carrying a numeric code from the frozen contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codes::OperationCode;
use crate::results::OperationResult;
use crate::substate::ExecutorSubState;
use crate::HealthState;

/// Error body returned by the coordinator when an operation fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcFailure {
    /// Numeric code from the frozen contract.
    pub code: i32,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: OperationCode, message: impl Into<String>) -> Self {
        Self {
            code: code.value(),
            message: message.into(),
        }
    }

    /// The typed code, when the numeric value is part of the contract.
    pub fn operation_code(&self) -> Option<OperationCode> {
        OperationCode::from_value(self.code)
    }
}

/// Approved-timestamp and timeout snapshot handed to the agent.
///
/// Persisted to disk on the node after every `GetWuOperationState` call so the
/// agent can compute the remaining installation budget without another round
/// trip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutorDataForNtService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    pub executor_timeout_minutes: i64,
}

/// Response of `GetWuOperationState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStateResponse {
    pub sub_state: ExecutorSubState,

    /// Present whenever an active task exists for the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_data: Option<ExecutorDataForNtService>,
}

/// Request body of `UpdateSearchAndDownloadStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSearchAndDownloadRequest {
    pub application_uri: String,
    pub sub_state: ExecutorSubState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,

    /// Installation budget recorded on the task being created.
    pub installation_timeout_minutes: i64,
}

/// Request body of `UpdateInstallationStatus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateInstallationRequest {
    pub application_uri: String,
    pub sub_state: ExecutorSubState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
}

/// Request body of `ReportHealth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHealthRequest {
    pub application_uri: String,
    pub property: String,
    pub description: String,
    pub state: HealthState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,

    /// Seconds the coordinator may spend waiting for the target service to
    /// appear before giving up with a timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_deadline_seconds: Option<i64>,
}

/// Response of `GetApplicationDeployedStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationDeployedStatus {
    Deployed,
    NotFound,
}

impl ApplicationDeployedStatus {
    /// Exit code of the agent-side helper for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Deployed => OperationCode::Success.value(),
            Self::NotFound => OperationCode::ApplicationNotFound.value(),
        }
    }
}
