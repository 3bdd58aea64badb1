//! Health fact publication.
//!
//! Facts are keyed by (service URI, property); re-publishing replaces the
//! previous fact. Publishing against a service that does not exist yet fails
//! permanently on the platform, so [`publish_when_ready`] verifies existence
//! first, retrying with linearly increasing back-off until a deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pos_model::HealthReport;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cluster::ClusterQuery;

/// Errors from health fact publication.
#[derive(Debug, Error)]
pub enum HealthBusError {
    #[error("target service does not exist: {0}")]
    ServiceNotFound(String),

    #[error("timed out waiting for service {0}")]
    ReadinessTimeout(String),

    /// Transient platform failure.
    #[error("health bus unavailable: {0}")]
    Unavailable(String),
}

/// Platform health-fact bus.
#[async_trait]
pub trait HealthBus: Send + Sync {
    async fn publish(&self, report: HealthReport) -> Result<(), HealthBusError>;
}

/// Publish a fact once the target service exists.
///
/// Back-off grows linearly (1s, 2s, 3s, ...) until `deadline` is exhausted.
pub async fn publish_when_ready(
    cluster: &dyn ClusterQuery,
    bus: &dyn HealthBus,
    report: HealthReport,
    deadline: Duration,
) -> Result<(), HealthBusError> {
    let mut waited = Duration::ZERO;
    let mut backoff = Duration::from_secs(1);

    loop {
        match cluster.service_exists(&report.service_uri).await {
            Ok(true) => return bus.publish(report).await,
            Ok(false) => {
                debug!(
                    service = %report.service_uri,
                    property = %report.property,
                    waited_secs = waited.as_secs(),
                    "Target service not present yet, backing off"
                );
            }
            Err(e) => {
                warn!(service = %report.service_uri, error = %e, "Service existence check failed");
            }
        }

        if waited + backoff > deadline {
            return Err(HealthBusError::ReadinessTimeout(report.service_uri));
        }
        tokio::time::sleep(backoff).await;
        waited += backoff;
        backoff += Duration::from_secs(1);
    }
}

/// Stored fact with its publication time, for TTL accounting.
#[derive(Debug, Clone)]
pub struct StoredFact {
    pub report: HealthReport,
    pub published_at: DateTime<Utc>,
}

impl StoredFact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.report.ttl_seconds {
            Some(ttl) => now >= self.published_at + chrono::Duration::seconds(ttl),
            None => false,
        }
    }
}

/// In-memory health fact table.
#[derive(Default)]
pub struct MemoryHealthBus {
    facts: Mutex<HashMap<(String, String), StoredFact>>,
}

impl MemoryHealthBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current fact for a (service, property) pair, if present and fresh.
    pub fn fact(&self, service_uri: &str, property: &str) -> Option<HealthReport> {
        let facts = self.facts.lock().expect("health facts lock");
        facts
            .get(&(service_uri.to_string(), property.to_string()))
            .filter(|f| !f.is_expired(Utc::now()))
            .map(|f| f.report.clone())
    }

    /// All live facts for a service.
    pub fn facts_for(&self, service_uri: &str) -> Vec<HealthReport> {
        let now = Utc::now();
        let facts = self.facts.lock().expect("health facts lock");
        facts
            .values()
            .filter(|f| f.report.service_uri == service_uri && !f.is_expired(now))
            .map(|f| f.report.clone())
            .collect()
    }

    /// Drop expired facts; returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut facts = self.facts.lock().expect("health facts lock");
        let before = facts.len();
        facts.retain(|_, f| !f.is_expired(now));
        before - facts.len()
    }

    /// Remove a fact outright (used when its subject disappears).
    pub fn remove(&self, service_uri: &str, property: &str) -> bool {
        let mut facts = self.facts.lock().expect("health facts lock");
        facts
            .remove(&(service_uri.to_string(), property.to_string()))
            .is_some()
    }

    /// Properties currently published against a service.
    pub fn properties_for(&self, service_uri: &str) -> Vec<String> {
        let facts = self.facts.lock().expect("health facts lock");
        facts
            .values()
            .filter(|f| f.report.service_uri == service_uri)
            .map(|f| f.report.property.clone())
            .collect()
    }
}

#[async_trait]
impl HealthBus for MemoryHealthBus {
    async fn publish(&self, report: HealthReport) -> Result<(), HealthBusError> {
        let mut facts = self.facts.lock().expect("health facts lock");
        facts.insert(
            (report.service_uri.clone(), report.property.clone()),
            StoredFact {
                report,
                published_at: Utc::now(),
            },
        );
        Ok(())
    }
}
