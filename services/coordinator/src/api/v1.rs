//! v1 routes: the six coordinator-agent operations plus the read-only
//! results endpoint.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use pos_model::{
    OperationCode, OperationResult, OperationType, ReportHealthRequest, RpcFailure,
    UpdateInstallationRequest, UpdateSearchAndDownloadRequest,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ops::OpError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/nodes/:node/operation-state", get(get_operation_state))
        .route(
            "/v1/nodes/:node/search-download-status",
            post(post_search_download_status),
        )
        .route(
            "/v1/nodes/:node/installation-status",
            post(post_installation_status),
        )
        .route("/v1/results", post(post_operation_result))
        .route("/v1/health-reports", post(post_health_report))
        .route(
            "/v1/applications/deployed-status",
            get(get_deployed_status),
        )
        .route("/v1/GetWindowsUpdateResults", get(get_update_results_default))
        .route(
            "/v1/GetWindowsUpdateResults/:operation_type",
            get(get_update_results),
        )
}

/// Operation-layer failures rendered as the numeric contract.
#[derive(Debug)]
struct ApiError(OpError);

impl From<OpError> for ApiError {
    fn from(e: OpError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = match code {
            OperationCode::InvalidArgument => StatusCode::BAD_REQUEST,
            OperationCode::RepairTaskInvalidState => StatusCode::CONFLICT,
            OperationCode::ServiceNotFound | OperationCode::ApplicationNotFound => {
                StatusCode::NOT_FOUND
            }
            OperationCode::RetryableException => StatusCode::SERVICE_UNAVAILABLE,
            OperationCode::TimeoutException => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(code = code.value(), error = %self.0, "Operation failed");
        (status, Json(RpcFailure::new(code, self.0.to_string()))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct OperationStateParams {
    /// System boot time of the calling node, used to detect completed reboots.
    #[serde(default)]
    boot_time: Option<DateTime<Utc>>,
}

async fn get_operation_state(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Query(params): Query<OperationStateParams>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .ops()
        .get_wu_operation_state(&node, params.boot_time)
        .await?;
    Ok(Json(response))
}

async fn post_search_download_status(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(request): Json<UpdateSearchAndDownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .ops()
        .update_search_and_download_status(&node, request)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_installation_status(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(request): Json<UpdateInstallationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.ops().update_installation_status(&node, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_operation_result(
    State(state): State<AppState>,
    Json(result): Json<OperationResult>,
) -> Result<impl IntoResponse, ApiError> {
    state.ops().update_wu_operation_result(result)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn post_health_report(
    State(state): State<AppState>,
    Json(request): Json<ReportHealthRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.ops().report_health(request).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct DeployedStatusParams {
    application_uri: String,
}

#[derive(Debug, Serialize)]
struct DeployedStatusResponse {
    status: pos_model::ApplicationDeployedStatus,
}

async fn get_deployed_status(
    State(state): State<AppState>,
    Query(params): Query<DeployedStatusParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .ops()
        .get_application_deployed_status(&params.application_uri)
        .await?;
    Ok(Json(DeployedStatusResponse { status }))
}

/// One node's slice of the results listing.
#[derive(Debug, Serialize)]
struct NodeResults {
    node_name: String,
    results: Vec<OperationResult>,
}

async fn get_update_results_default(
    state: State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    get_update_results(state, Path("Installation".to_string())).await
}

async fn get_update_results(
    State(state): State<AppState>,
    Path(operation_type): Path<String>,
) -> Result<Json<Vec<NodeResults>>, ApiError> {
    let operation_type: OperationType = operation_type
        .parse()
        .map_err(OpError::InvalidArgument)?;

    let grouped = state
        .ops()
        .results()
        .grouped_by_node(operation_type)
        .map_err(OpError::from)?;
    let body = grouped
        .into_iter()
        .map(|(node_name, results)| NodeResults { node_name, results })
        .collect();
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::config::Config;
    use crate::healthbus::MemoryHealthBus;
    use crate::ops::{CoordinatorOps, NodeStatusBoard};
    use crate::registry::MemoryRepairRegistry;
    use crate::results::ResultStore;
    use chrono::Utc;
    use pos_model::{OperationType, UpdateOperationOutcome};
    use std::sync::Arc;

    fn test_state() -> AppState {
        let ops = CoordinatorOps::new(
            Arc::new(MemoryRepairRegistry::new()),
            Arc::new(MemoryCluster::new(vec![])),
            Arc::new(MemoryHealthBus::new()),
            Arc::new(ResultStore::open_in_memory(10).unwrap()),
            Arc::new(NodeStatusBoard::new()),
            Config::default(),
        );
        AppState::new(Arc::new(ops))
    }

    fn sample_result(node: &str, operation_type: OperationType) -> OperationResult {
        OperationResult {
            node_name: node.to_string(),
            operation_time: Utc::now(),
            operation_start_time: Utc::now(),
            operation_type,
            operation_result: UpdateOperationOutcome::Succeeded,
            update_details: Vec::new(),
            windows_update_query: "IsInstalled=0".to_string(),
            windows_update_frequency: "None".to_string(),
            reboot_required: false,
        }
    }

    #[tokio::test]
    async fn test_results_endpoint_groups_by_node() {
        let state = test_state();
        for node in ["n2", "n1", "n2"] {
            state
                .ops()
                .update_wu_operation_result(sample_result(node, OperationType::Installation))
                .unwrap();
        }
        state
            .ops()
            .update_wu_operation_result(sample_result("n1", OperationType::SearchAndDownload))
            .unwrap();

        let Json(body) = get_update_results(State(state), Path("Installation".to_string()))
            .await
            .unwrap();

        assert_eq!(body.len(), 2);
        assert_eq!(body[0].node_name, "n1");
        assert_eq!(body[0].results.len(), 1);
        assert_eq!(body[1].node_name, "n2");
        assert_eq!(body[1].results.len(), 2);
    }

    #[tokio::test]
    async fn test_results_endpoint_defaults_to_installation() {
        let state = test_state();
        state
            .ops()
            .update_wu_operation_result(sample_result("n1", OperationType::Installation))
            .unwrap();
        state
            .ops()
            .update_wu_operation_result(sample_result("n1", OperationType::SearchAndDownload))
            .unwrap();

        let response = get_update_results_default(State(state))
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_results_endpoint_rejects_unknown_type() {
        let state = test_state();
        let err = get_update_results(State(state), Path("Everything".to_string()))
            .await
            .err()
            .unwrap();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_deployed_status_handler() {
        let registry = Arc::new(MemoryRepairRegistry::new());
        let cluster = Arc::new(MemoryCluster::new(vec![]));
        cluster.add_application("fabric:/Pos");
        let ops = CoordinatorOps::new(
            registry,
            cluster,
            Arc::new(MemoryHealthBus::new()),
            Arc::new(ResultStore::open_in_memory(10).unwrap()),
            Arc::new(NodeStatusBoard::new()),
            Config::default(),
        );
        let state = AppState::new(Arc::new(ops));

        let response = get_deployed_status(
            State(state),
            Query(DeployedStatusParams {
                application_uri: "fabric:/Pos".to_string(),
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
