//! Cluster node identity as reported by the platform.

use serde::{Deserialize, Serialize};

/// Node membership status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Up,
    Down,
    Other,
}

/// A cluster node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub status: NodeStatus,

    /// Update-domain label supplied by the platform.
    pub update_domain: String,
}

impl NodeInfo {
    pub fn up(name: &str, update_domain: &str) -> Self {
        Self {
            name: name.to_string(),
            status: NodeStatus::Up,
            update_domain: update_domain.to_string(),
        }
    }
}
