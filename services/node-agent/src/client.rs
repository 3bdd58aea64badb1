//! Coordinator RPC client for the node agent.
//!
//! The agent keeps the cluster-side state machine consistent through six
//! operations. The channel trait abstracts the transport so tests can drive
//! the operation layer directly; the HTTP implementation talks to the
//! coordinator's serving surface.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pos_model::{
    ApplicationDeployedStatus, OperationCode, OperationResult, OperationStateResponse,
    ReportHealthRequest, RpcFailure, UpdateInstallationRequest, UpdateSearchAndDownloadRequest,
};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::Config;

/// Errors from coordinator calls.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The call never produced a contract answer; retry later.
    #[error("transport error: {0}")]
    Transport(String),

    /// The coordinator answered with a contract failure code.
    #[error("coordinator rejected the call (code {code}): {message}")]
    Contract { code: i32, message: String },
}

impl RpcError {
    /// Numeric contract code for this failure.
    pub fn code(&self) -> OperationCode {
        match self {
            Self::Transport(_) => OperationCode::RetryableException,
            Self::Contract { code, .. } => {
                OperationCode::from_value(*code).unwrap_or(OperationCode::Failure)
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// The six coordinator operations, node-side view.
#[async_trait]
pub trait CoordinatorChannel: Send + Sync {
    async fn get_operation_state(
        &self,
        boot_time: Option<DateTime<Utc>>,
    ) -> Result<OperationStateResponse, RpcError>;

    async fn update_search_and_download_status(
        &self,
        request: UpdateSearchAndDownloadRequest,
    ) -> Result<(), RpcError>;

    async fn update_installation_status(
        &self,
        request: UpdateInstallationRequest,
    ) -> Result<(), RpcError>;

    async fn update_operation_result(&self, result: OperationResult) -> Result<(), RpcError>;

    async fn report_health(&self, request: ReportHealthRequest) -> Result<(), RpcError>;

    async fn application_deployed_status(
        &self,
        application_uri: &str,
    ) -> Result<ApplicationDeployedStatus, RpcError>;
}

/// HTTP client against the coordinator's serving surface.
pub struct HttpCoordinatorClient {
    client: reqwest::Client,
    base_url: String,
    node_name: String,
    checkpoints: Option<CheckpointStore>,
}

impl HttpCoordinatorClient {
    pub fn new(config: &Config, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.coordinator_url.clone(),
            node_name: config.node_name.clone(),
            checkpoints: None,
        }
    }

    /// Persist the executor-data snapshot after every state read so the
    /// install-budget math survives a process restart.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RpcError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RpcFailure>(&body) {
            Ok(failure) => {
                warn!(code = failure.code, message = %failure.message, "Coordinator returned a contract failure");
                Err(RpcError::Contract {
                    code: failure.code,
                    message: failure.message,
                })
            }
            Err(_) => {
                error!(status = %status, body = %body, "Coordinator call failed without contract body");
                Err(RpcError::Transport(format!("{status}: {body}")))
            }
        }
    }
}

#[async_trait]
impl CoordinatorChannel for HttpCoordinatorClient {
    async fn get_operation_state(
        &self,
        boot_time: Option<DateTime<Utc>>,
    ) -> Result<OperationStateResponse, RpcError> {
        let url = format!("{}/v1/nodes/{}/operation-state", self.base_url, self.node_name);
        debug!(url = %url, "Reading operation state");

        let mut request = self.client.get(&url);
        if let Some(boot_time) = boot_time {
            request = request.query(&[("boot_time", boot_time.to_rfc3339())]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let response = Self::check_status(response).await?;
        let state: OperationStateResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        if let (Some(checkpoints), Some(data)) = (&self.checkpoints, &state.executor_data) {
            if let Err(e) = checkpoints.save_executor_snapshot(data) {
                warn!(error = %e, "Failed to persist executor-data snapshot");
            }
        }

        Ok(state)
    }

    async fn update_search_and_download_status(
        &self,
        request: UpdateSearchAndDownloadRequest,
    ) -> Result<(), RpcError> {
        let url = format!(
            "{}/v1/nodes/{}/search-download-status",
            self.base_url, self.node_name
        );
        debug!(url = %url, sub_state = %request.sub_state, "Posting search-and-download status");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn update_installation_status(
        &self,
        request: UpdateInstallationRequest,
    ) -> Result<(), RpcError> {
        let url = format!(
            "{}/v1/nodes/{}/installation-status",
            self.base_url, self.node_name
        );
        debug!(url = %url, sub_state = %request.sub_state, "Posting installation status");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn update_operation_result(&self, result: OperationResult) -> Result<(), RpcError> {
        let url = format!("{}/v1/results", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&result)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn report_health(&self, request: ReportHealthRequest) -> Result<(), RpcError> {
        let url = format!("{}/v1/health-reports", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn application_deployed_status(
        &self,
        application_uri: &str,
    ) -> Result<ApplicationDeployedStatus, RpcError> {
        let url = format!("{}/v1/applications/deployed-status", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("application_uri", application_uri)])
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        // A contract "not found" is a definite answer, not a failure.
        match Self::check_status(response).await {
            Ok(response) => {
                #[derive(serde::Deserialize)]
                struct Body {
                    status: ApplicationDeployedStatus,
                }
                let body: Body = response
                    .json()
                    .await
                    .map_err(|e| RpcError::Transport(e.to_string()))?;
                Ok(body.status)
            }
            Err(RpcError::Contract { code, .. })
                if code == OperationCode::ApplicationNotFound.value() =>
            {
                Ok(ApplicationDeployedStatus::NotFound)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_codes() {
        let transport = RpcError::Transport("connection refused".to_string());
        assert_eq!(transport.code(), OperationCode::RetryableException);
        assert!(transport.is_retryable());

        let contract = RpcError::Contract {
            code: -5,
            message: "bad state".to_string(),
        };
        assert_eq!(contract.code(), OperationCode::RepairTaskInvalidState);
        assert!(!contract.is_retryable());

        // Unknown codes collapse to fatal failure.
        let unknown = RpcError::Contract {
            code: -99,
            message: "?".to_string(),
        };
        assert_eq!(unknown.code(), OperationCode::Failure);
    }
}
