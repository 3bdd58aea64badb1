//! Repair registry interface and in-memory implementation.
//!
//! The platform's repair registry owns the durable repair-task records. The
//! coordinator mutates them exclusively through this interface, carrying the
//! version read in the same tick for optimistic concurrency.
//!
//! The in-memory implementation backs tests and the single-process dev loop;
//! it also simulates the platform-owned `Preparing -> Approved` transition on
//! request so flows can be driven end to end.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pos_model::{RepairTask, TaskState};
use thiserror::Error;

/// Errors from repair registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("repair task not found: {0}")]
    NotFound(String),

    #[error("version conflict on {task_id}: expected {expected}, current {current}")]
    VersionConflict {
        task_id: String,
        expected: u64,
        current: u64,
    },

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    /// Transient platform failure (throttling, leader change). Retry next tick.
    #[error("repair registry unavailable: {0}")]
    Unavailable(String),

    #[error("repair registry operation timed out: {0}")]
    Timeout(String),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::VersionConflict { .. })
    }
}

/// Durable repair-task registry owned by the platform.
#[async_trait]
pub trait RepairRegistry: Send + Sync {
    /// Whether the registry service is present in the cluster.
    async fn is_available(&self) -> bool;

    /// List tasks whose id starts with `prefix`.
    async fn list_tasks(&self, prefix: &str) -> Result<Vec<RepairTask>, RegistryError>;

    /// Create a task. Returns the stored record with its initial version.
    async fn create_task(&self, task: RepairTask) -> Result<RepairTask, RegistryError>;

    /// Write back a task. `task.version` must match the stored version;
    /// returns the record with its new version.
    async fn update_task(&self, task: RepairTask) -> Result<RepairTask, RegistryError>;

    /// Re-stamp the task's health policy, returning the latest record. Run
    /// before promotion so the subsequent write carries the newest version.
    async fn refresh_health_policy(&self, task_id: &str) -> Result<RepairTask, RegistryError>;
}

/// In-memory registry with optimistic versioning.
#[derive(Default)]
pub struct MemoryRepairRegistry {
    tasks: Mutex<HashMap<String, RepairTask>>,
    available: std::sync::atomic::AtomicBool,
}

impl MemoryRepairRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Simulate the repair registry service disappearing.
    pub fn set_available(&self, available: bool) {
        self.available
            .store(available, std::sync::atomic::Ordering::SeqCst);
    }

    /// Simulate the platform health check + node disable that drives
    /// `Preparing -> Approved`. Returns the ids it advanced.
    pub fn platform_approve_prepared(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut tasks = self.tasks.lock().expect("registry lock");
        let mut approved = Vec::new();
        for task in tasks.values_mut() {
            if task.state == TaskState::Preparing {
                task.state = TaskState::Approved;
                task.approved_at = Some(now);
                task.version += 1;
                approved.push(task.task_id.clone());
            }
        }
        approved
    }

    /// Simulate the platform restoring a task (re-enable node) and completing it.
    pub fn platform_complete_restoring(&self) -> Vec<String> {
        let mut tasks = self.tasks.lock().expect("registry lock");
        let mut completed = Vec::new();
        for task in tasks.values_mut() {
            if task.state == TaskState::Restoring {
                task.state = TaskState::Completed;
                task.version += 1;
                completed.push(task.task_id.clone());
            }
        }
        completed
    }

    fn check_available(&self) -> Result<(), RegistryError> {
        if self.available.load(std::sync::atomic::Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(
                "repair registry service not present".to_string(),
            ))
        }
    }
}

#[async_trait]
impl RepairRegistry for MemoryRepairRegistry {
    async fn is_available(&self) -> bool {
        self.available.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn list_tasks(&self, prefix: &str) -> Result<Vec<RepairTask>, RegistryError> {
        self.check_available()?;
        let tasks = self.tasks.lock().expect("registry lock");
        let mut matching: Vec<RepairTask> = tasks
            .values()
            .filter(|t| t.task_id.starts_with(prefix))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.task_id.cmp(&b.task_id)));
        Ok(matching)
    }

    async fn create_task(&self, mut task: RepairTask) -> Result<RepairTask, RegistryError> {
        self.check_available()?;
        let mut tasks = self.tasks.lock().expect("registry lock");
        if tasks.contains_key(&task.task_id) {
            return Err(RegistryError::AlreadyExists(task.task_id));
        }
        task.version = 1;
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn update_task(&self, mut task: RepairTask) -> Result<RepairTask, RegistryError> {
        self.check_available()?;
        let mut tasks = self.tasks.lock().expect("registry lock");
        let current = tasks
            .get(&task.task_id)
            .ok_or_else(|| RegistryError::NotFound(task.task_id.clone()))?;
        if current.version != task.version {
            return Err(RegistryError::VersionConflict {
                task_id: task.task_id.clone(),
                expected: task.version,
                current: current.version,
            });
        }
        task.version += 1;
        tasks.insert(task.task_id.clone(), task.clone());
        Ok(task)
    }

    async fn refresh_health_policy(&self, task_id: &str) -> Result<RepairTask, RegistryError> {
        self.check_available()?;
        let mut tasks = self.tasks.lock().expect("registry lock");
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RegistryError::NotFound(task_id.to_string()))?;
        // The policy re-stamp is a write; it bumps the version like any other.
        task.version += 1;
        Ok(task.clone())
    }
}
