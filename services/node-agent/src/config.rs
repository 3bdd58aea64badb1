use anyhow::Result;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub coordinator_url: String,
    pub application_uri: String,
    pub node_service_uri: String,
    pub work_dir: String,
    pub scheduler_tick: Duration,
    pub log_level: String,
    pub logs_disk_quota_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_name = std::env::var("POS_NODE_NAME")
            .unwrap_or_else(|_| hostname_fallback());

        let coordinator_url = std::env::var("POS_COORDINATOR_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7280".to_string());

        let application_uri = std::env::var("POS_APPLICATION_URI")
            .unwrap_or_else(|_| "fabric:/PatchOrchestration".to_string());

        let node_service_uri = std::env::var("POS_NODE_SERVICE_URI")
            .unwrap_or_else(|_| "fabric:/PatchOrchestration/NodeAgent".to_string());

        let work_dir =
            std::env::var("POS_WORK_DIR").unwrap_or_else(|_| "/var/lib/pos/agent".to_string());

        let scheduler_tick = std::env::var("POS_SCHEDULER_TICK_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5 * 60));

        let log_level = std::env::var("POS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let logs_disk_quota_bytes = std::env::var("POS_LOGS_DISK_QUOTA_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(256 * 1024 * 1024);

        Ok(Self {
            node_name,
            coordinator_url,
            application_uri,
            node_service_uri,
            work_dir,
            scheduler_tick,
            log_level,
            logs_disk_quota_bytes,
        })
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
