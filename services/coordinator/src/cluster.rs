//! Cluster topology and deployment queries.
//!
//! The platform answers who is in the cluster, whether applications and
//! services exist, and what the aggregated cluster health looks like. The
//! in-memory implementation backs tests and the single-process dev loop.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use pos_model::{HealthState, NodeInfo};
use thiserror::Error;

/// Errors from cluster queries.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Transient platform failure. Retry next tick.
    #[error("cluster query failed: {0}")]
    Unavailable(String),
}

/// Read-only view of the hosting platform.
#[async_trait]
pub trait ClusterQuery: Send + Sync {
    /// Current node list with membership status and update domains.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;

    /// Whether an application is deployed.
    async fn application_exists(&self, application_uri: &str) -> Result<bool, ClusterError>;

    /// Whether a service exists (health facts against absent services fail
    /// permanently, so publishers check first).
    async fn service_exists(&self, service_uri: &str) -> Result<bool, ClusterError>;

    /// Aggregated cluster health.
    async fn cluster_health(&self) -> Result<HealthState, ClusterError>;
}

/// In-memory cluster view.
pub struct MemoryCluster {
    inner: Mutex<MemoryClusterInner>,
}

struct MemoryClusterInner {
    nodes: Vec<NodeInfo>,
    applications: HashSet<String>,
    services: HashSet<String>,
    health: HealthState,
}

impl MemoryCluster {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        Self {
            inner: Mutex::new(MemoryClusterInner {
                nodes,
                applications: HashSet::new(),
                services: HashSet::new(),
                health: HealthState::Ok,
            }),
        }
    }

    pub fn set_nodes(&self, nodes: Vec<NodeInfo>) {
        self.inner.lock().expect("cluster lock").nodes = nodes;
    }

    pub fn add_application(&self, uri: &str) {
        self.inner
            .lock()
            .expect("cluster lock")
            .applications
            .insert(uri.to_string());
    }

    pub fn remove_application(&self, uri: &str) {
        self.inner
            .lock()
            .expect("cluster lock")
            .applications
            .remove(uri);
    }

    pub fn add_service(&self, uri: &str) {
        self.inner
            .lock()
            .expect("cluster lock")
            .services
            .insert(uri.to_string());
    }

    pub fn set_health(&self, health: HealthState) {
        self.inner.lock().expect("cluster lock").health = health;
    }
}

#[async_trait]
impl ClusterQuery for MemoryCluster {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        Ok(self.inner.lock().expect("cluster lock").nodes.clone())
    }

    async fn application_exists(&self, application_uri: &str) -> Result<bool, ClusterError> {
        Ok(self
            .inner
            .lock()
            .expect("cluster lock")
            .applications
            .contains(application_uri))
    }

    async fn service_exists(&self, service_uri: &str) -> Result<bool, ClusterError> {
        Ok(self
            .inner
            .lock()
            .expect("cluster lock")
            .services
            .contains(service_uri))
    }

    async fn cluster_health(&self) -> Result<HealthState, ClusterError> {
        Ok(self.inner.lock().expect("cluster lock").health)
    }
}
