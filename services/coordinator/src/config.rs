//! Configuration for the coordinator.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;

/// Which claimed tasks the coordinator may promote per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskApprovalPolicy {
    /// At most one node is disrupted at any instant.
    NodeWise,
    /// All nodes of one update domain may be disrupted together.
    UpgradeDomainWise,
}

impl std::str::FromStr for TaskApprovalPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NodeWise" => Ok(Self::NodeWise),
            "UpgradeDomainWise" => Ok(Self::UpgradeDomainWise),
            other => anyhow::bail!("unknown task approval policy: {other}"),
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on for the RPC/read surface.
    pub listen_addr: SocketAddr,

    /// Tick interval of the control loop.
    pub polling_frequency: Duration,

    /// FIFO bound of the result store.
    pub max_results_to_cache: u32,

    pub task_approval_policy: TaskApprovalPolicy,

    /// Skip (not cancel) claimed tasks whose node is not `Up`.
    pub install_on_up_nodes_only: bool,

    /// Whether the timeout pass may cancel overrunning tasks.
    pub manage_repair_tasks_on_timeout: bool,

    /// Per-operation deadline for platform calls.
    pub default_operation_timeout: Duration,

    /// Slack granted to the agent on top of the per-task installation budget.
    pub grace_time_for_nt_service: Duration,

    /// Minimum wait between finishing one node and approving the next.
    pub min_wait_time_between_nodes: Duration,

    /// Path of the result store database.
    pub result_store_path: String,

    /// Service URI health facts about the coordinator are published against.
    pub coordinator_service_uri: String,
}

impl Config {
    /// Load configuration from environment variables, applying defaults.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("POS_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7280".to_string())
            .parse()?;

        let polling_frequency = Duration::from_secs(env_u64("POS_POLLING_FREQUENCY_IN_SEC", 60)?);
        let max_results_to_cache = env_u64("POS_MAX_RESULTS_TO_CACHE", 3000)? as u32;

        let task_approval_policy = std::env::var("POS_TASK_APPROVAL_POLICY")
            .unwrap_or_else(|_| "NodeWise".to_string())
            .parse()?;

        let install_on_up_nodes_only = env_bool("POS_INSTALL_ON_UP_NODES_ONLY", true)?;
        let manage_repair_tasks_on_timeout = env_bool("POS_MANAGE_REPAIR_TASKS_ON_TIMEOUT", true)?;

        let default_operation_timeout =
            Duration::from_secs(env_u64("POS_DEFAULT_TIMEOUT_FOR_OPERATION_MIN", 5)? * 60);
        let grace_time_for_nt_service =
            Duration::from_secs(env_u64("POS_GRACE_TIME_FOR_NT_SERVICE_MIN", 45)? * 60);
        let min_wait_time_between_nodes =
            Duration::from_secs(env_u64("POS_MIN_WAIT_TIME_BETWEEN_NODES_MIN", 0)? * 60);

        let result_store_path = std::env::var("POS_RESULT_STORE_PATH")
            .unwrap_or_else(|_| "/var/lib/pos/results.db".to_string());

        let coordinator_service_uri = std::env::var("POS_COORDINATOR_SERVICE_URI")
            .unwrap_or_else(|_| "fabric:/PatchOrchestration/Coordinator".to_string());

        Ok(Self {
            listen_addr,
            polling_frequency,
            max_results_to_cache,
            task_approval_policy,
            install_on_up_nodes_only,
            manage_repair_tasks_on_timeout,
            default_operation_timeout,
            grace_time_for_nt_service,
            min_wait_time_between_nodes,
            result_store_path,
            coordinator_service_uri,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7280".parse().expect("static addr"),
            polling_frequency: Duration::from_secs(60),
            max_results_to_cache: 3000,
            task_approval_policy: TaskApprovalPolicy::NodeWise,
            install_on_up_nodes_only: true,
            manage_repair_tasks_on_timeout: true,
            default_operation_timeout: Duration::from_secs(5 * 60),
            grace_time_for_nt_service: Duration::from_secs(45 * 60),
            min_wait_time_between_nodes: Duration::ZERO,
            result_store_path: "/var/lib/pos/results.db".to_string(),
            coordinator_service_uri: "fabric:/PatchOrchestration/Coordinator".to_string(),
        }
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            _ => anyhow::bail!("{key} must be a boolean, got '{raw}'"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.polling_frequency, Duration::from_secs(60));
        assert_eq!(config.max_results_to_cache, 3000);
        assert_eq!(config.task_approval_policy, TaskApprovalPolicy::NodeWise);
        assert!(config.install_on_up_nodes_only);
        assert!(config.manage_repair_tasks_on_timeout);
        assert_eq!(config.default_operation_timeout, Duration::from_secs(300));
        assert_eq!(config.grace_time_for_nt_service, Duration::from_secs(2700));
        assert_eq!(config.min_wait_time_between_nodes, Duration::ZERO);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "NodeWise".parse::<TaskApprovalPolicy>().unwrap(),
            TaskApprovalPolicy::NodeWise
        );
        assert_eq!(
            "UpgradeDomainWise".parse::<TaskApprovalPolicy>().unwrap(),
            TaskApprovalPolicy::UpgradeDomainWise
        );
        assert!("nodewise".parse::<TaskApprovalPolicy>().is_err());
    }
}
