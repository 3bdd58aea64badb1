//! Host OS control seam.
//!
//! The agent needs a handful of host operations that are platform glue, not
//! update logic: the system boot time (to detect completed reboots), a
//! restart request that first stops the platform services, and service
//! teardown when the deployment disappears.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

/// Errors from host OS operations.
#[derive(Debug, Error)]
pub enum OsError {
    #[error("os operation failed: {0}")]
    Operation(String),
}

/// Host operations the agent depends on.
#[async_trait]
pub trait OsControl: Send + Sync {
    /// When the host last booted.
    async fn system_boot_time(&self) -> Result<DateTime<Utc>, OsError>;

    /// Stop platform services and request an OS restart. The agent process
    /// does not survive this on a real host.
    async fn request_restart(&self) -> Result<(), OsError>;

    /// Remove the agent's own service registration; used when the deployed
    /// application no longer exists.
    async fn tear_down_service(&self) -> Result<(), OsError>;
}

/// Best-effort host implementation.
///
/// Boot time is derived from the kernel uptime counter; restart and teardown
/// are delegated to the platform installer scripts and only logged here.
pub struct HostOs;

#[async_trait]
impl OsControl for HostOs {
    async fn system_boot_time(&self) -> Result<DateTime<Utc>, OsError> {
        let uptime = std::fs::read_to_string("/proc/uptime")
            .map_err(|e| OsError::Operation(format!("reading uptime: {e}")))?;
        let seconds: f64 = uptime
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| OsError::Operation(format!("unparsable uptime: {uptime}")))?;
        Ok(Utc::now() - Duration::seconds(seconds as i64))
    }

    async fn request_restart(&self) -> Result<(), OsError> {
        warn!("Host restart requested; handing off to the platform restart hook");
        Ok(())
    }

    async fn tear_down_service(&self) -> Result<(), OsError> {
        warn!("Service teardown requested; handing off to the platform uninstall hook");
        Ok(())
    }
}

/// Mock host for testing.
pub struct MockOs {
    boot_time: Mutex<DateTime<Utc>>,
    restart_requested: AtomicBool,
    teardown_requested: AtomicBool,
}

impl MockOs {
    pub fn new(boot_time: DateTime<Utc>) -> Self {
        Self {
            boot_time: Mutex::new(boot_time),
            restart_requested: AtomicBool::new(false),
            teardown_requested: AtomicBool::new(false),
        }
    }

    /// Simulate the reboot completing.
    pub fn set_boot_time(&self, at: DateTime<Utc>) {
        *self.boot_time.lock().expect("mock lock") = at;
    }

    pub fn restart_was_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    pub fn teardown_was_requested(&self) -> bool {
        self.teardown_requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OsControl for MockOs {
    async fn system_boot_time(&self) -> Result<DateTime<Utc>, OsError> {
        Ok(*self.boot_time.lock().expect("mock lock"))
    }

    async fn request_restart(&self) -> Result<(), OsError> {
        info!("[MOCK] Restart requested");
        self.restart_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn tear_down_service(&self) -> Result<(), OsError> {
        info!("[MOCK] Service teardown requested");
        self.teardown_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}
