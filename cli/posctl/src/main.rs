//! Agent-side helper CLI.
//!
//! Thin process boundary between the node service and the coordinator. Each
//! command maps onto one coordinator operation, and the process exit code is
//! the numeric contract: zero or a positive sub-state value on success, a
//! negative code on failure. Command names are case-sensitive.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pos_model::{
    ExecutorSubState, HealthState, OperationCode, OperationResult, ReportHealthRequest,
    UpdateInstallationRequest, UpdateSearchAndDownloadRequest,
};
use pos_node_agent::checkpoint::CheckpointStore;
use pos_node_agent::client::{CoordinatorChannel, HttpCoordinatorClient, RpcError};
use pos_node_agent::config::Config;
use pos_node_agent::os::{HostOs, OsControl};
use pos_node_agent::workdir::WorkDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "posctl", version, about = "Patch orchestration helper")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read the node's current operation sub-state.
    #[command(name = "GetWuOperationState")]
    GetWuOperationState {
        node_name: String,
        timeout_seconds: u64,
    },

    /// Record the search-and-download outcome for a node.
    #[command(name = "UpdateSearchAndDownloadStatus")]
    UpdateSearchAndDownloadStatus {
        node_name: String,
        application_uri: String,
        sub_state: String,
        installation_timeout_minutes: i64,
        timeout_seconds: u64,
        result_file_path: Option<PathBuf>,
    },

    /// Record installation progress for a node.
    #[command(name = "UpdateInstallationStatus")]
    UpdateInstallationStatus {
        node_name: String,
        application_uri: String,
        sub_state: String,
        timeout_seconds: u64,
        result_file_path: Option<PathBuf>,
    },

    /// Publish a health fact against a service.
    #[command(name = "ReportHealth")]
    ReportHealth {
        application_uri: String,
        property: String,
        description: String,
        health_state: String,
        ttl_minutes: i64,
        timeout_seconds: u64,
    },

    /// Check whether an application is deployed.
    #[command(name = "GetApplicationDeployedStatus")]
    GetApplicationDeployedStatus {
        application_uri: String,
        timeout_seconds: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = run(cli.command).await;
    std::process::exit(code);
}

async fn run(command: Command) -> i32 {
    match command {
        Command::GetWuOperationState {
            node_name,
            timeout_seconds,
        } => {
            let client = client_for(&node_name, timeout_seconds, true);
            let boot_time = HostOs.system_boot_time().await.ok();
            match client.get_operation_state(boot_time).await {
                Ok(state) => {
                    println!("{}", state.sub_state);
                    state.sub_state.value()
                }
                Err(e) => fail(e),
            }
        }

        Command::UpdateSearchAndDownloadStatus {
            node_name,
            application_uri,
            sub_state,
            installation_timeout_minutes,
            timeout_seconds,
            result_file_path,
        } => {
            let Ok(sub_state) = sub_state.parse::<ExecutorSubState>() else {
                eprintln!("unknown sub-state: {sub_state}");
                return OperationCode::InvalidArgument.value();
            };
            let result = match read_result_file(result_file_path) {
                Ok(result) => result,
                Err(code) => return code,
            };

            let client = client_for(&node_name, timeout_seconds, false);
            let request = UpdateSearchAndDownloadRequest {
                application_uri,
                sub_state,
                result,
                installation_timeout_minutes,
            };
            match client.update_search_and_download_status(request).await {
                Ok(()) => OperationCode::Success.value(),
                Err(e) => fail(e),
            }
        }

        Command::UpdateInstallationStatus {
            node_name,
            application_uri,
            sub_state,
            timeout_seconds,
            result_file_path,
        } => {
            let Ok(sub_state) = sub_state.parse::<ExecutorSubState>() else {
                eprintln!("unknown sub-state: {sub_state}");
                return OperationCode::InvalidArgument.value();
            };
            let result = match read_result_file(result_file_path) {
                Ok(result) => result,
                Err(code) => return code,
            };

            let client = client_for(&node_name, timeout_seconds, false);
            let request = UpdateInstallationRequest {
                application_uri,
                sub_state,
                result,
            };
            match client.update_installation_status(request).await {
                Ok(()) => OperationCode::Success.value(),
                Err(e) => fail(e),
            }
        }

        Command::ReportHealth {
            application_uri,
            property,
            description,
            health_state,
            ttl_minutes,
            timeout_seconds,
        } => {
            let Ok(state) = health_state.parse::<HealthState>() else {
                eprintln!("unknown health state: {health_state}");
                return OperationCode::InvalidArgument.value();
            };

            let client = client_for("", timeout_seconds, false);
            let request = ReportHealthRequest {
                application_uri,
                property,
                description,
                state,
                ttl_seconds: (ttl_minutes > 0).then_some(ttl_minutes * 60),
                readiness_deadline_seconds: Some(timeout_seconds as i64),
            };
            match client.report_health(request).await {
                Ok(()) => OperationCode::Success.value(),
                Err(e) => fail(e),
            }
        }

        Command::GetApplicationDeployedStatus {
            application_uri,
            timeout_seconds,
        } => {
            let client = client_for("", timeout_seconds, false);
            match client.application_deployed_status(&application_uri).await {
                Ok(status) => {
                    println!("{:?}", status);
                    status.exit_code()
                }
                Err(e) => fail(e),
            }
        }
    }
}

/// Build the coordinator client, overriding the node name from the command
/// line. State reads persist the executor snapshot for the node service.
fn client_for(node_name: &str, timeout_seconds: u64, persist_snapshot: bool) -> HttpCoordinatorClient {
    let mut config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        std::process::exit(OperationCode::InvalidArgument.value());
    });
    if !node_name.is_empty() {
        config.node_name = node_name.to_string();
    }

    let client = HttpCoordinatorClient::new(&config, Duration::from_secs(timeout_seconds.max(1)));
    if persist_snapshot {
        let workdir = WorkDir::new(&config.work_dir);
        if workdir.ensure_layout().is_ok() {
            return client.with_checkpoints(CheckpointStore::new(workdir));
        }
    }
    client
}

fn read_result_file(path: Option<PathBuf>) -> Result<Option<OperationResult>, i32> {
    let Some(path) = path else {
        return Ok(None);
    };
    let raw = fs::read_to_string(&path).map_err(|e| {
        eprintln!("cannot read result file {}: {e}", path.display());
        OperationCode::InvalidArgument.value()
    })?;
    let result = serde_json::from_str(&raw).map_err(|e| {
        eprintln!("result file {} does not parse: {e}", path.display());
        OperationCode::InvalidArgument.value()
    })?;
    Ok(Some(result))
}

fn fail(error: RpcError) -> i32 {
    eprintln!("{error}");
    error.code().value()
}
