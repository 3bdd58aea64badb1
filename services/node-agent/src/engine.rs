//! Update engine interface and mock implementation.
//!
//! The engine abstracts the host's OS-update surface:
//! - Searching for applicable updates by query
//! - Downloading and installing update sets
//! - EULA acceptance and the pending-reboot flag
//!
//! A mock implementation is provided for testing and development.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pos_model::{UpdateDetail, UpdateOperationOutcome, OS_UPDATES_CATEGORY_ID};
use thiserror::Error;
use tracing::{debug, info};

/// Engine result code meaning the search surface had nothing applicable.
/// Treated as success rather than a failed cycle.
pub const NO_UPDATES_HRESULT: i64 = 0x8024_0024;

/// Errors from the update engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine operation failed: {0}")]
    Operation(String),

    #[error("engine operation timed out after {0:?}")]
    Timeout(Duration),

    /// A host library the engine depends on is missing. The agent exits with
    /// a dedicated code so the platform restarts it with a fresh environment.
    #[error("required OS component missing: {0}")]
    MissingComponent(String),
}

/// Update category, forming a chain to the root via `parent`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCategory {
    pub id: String,
    pub name: String,
    pub parent: Option<Box<UpdateCategory>>,
}

impl UpdateCategory {
    pub fn root(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            parent: None,
        }
    }

    pub fn child_of(id: &str, name: &str, parent: UpdateCategory) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            parent: Some(Box::new(parent)),
        }
    }
}

/// An update the search surfaced.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailableUpdate {
    pub update_id: String,
    pub title: String,
    pub description: String,
    pub categories: Vec<UpdateCategory>,
    pub eula_accepted: bool,
}

/// Outcome of a download or install pass.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub outcome: UpdateOperationOutcome,
    pub details: Vec<UpdateDetail>,
    pub reboot_required: bool,
}

/// Classify an engine result code. Zero and the no-updates code are success.
pub fn outcome_from_hresult(hresult: i64) -> UpdateOperationOutcome {
    if hresult == 0 || hresult == NO_UPDATES_HRESULT {
        UpdateOperationOutcome::Succeeded
    } else {
        UpdateOperationOutcome::Failed
    }
}

/// Whether an update passes the category whitelist.
///
/// An empty whitelist admits everything. Otherwise one of the update's
/// categories, or any ancestor reached through `parent`, must be listed.
pub fn category_matches(update: &AvailableUpdate, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    for category in &update.categories {
        let mut current = Some(category);
        while let Some(cat) = current {
            if whitelist.iter().any(|id| id.eq_ignore_ascii_case(&cat.id)) {
                return true;
            }
            current = cat.parent.as_deref();
        }
    }
    false
}

/// The effective category whitelist for a settings pair.
pub fn effective_whitelist(category_ids: &[String], os_only: bool) -> Vec<String> {
    let mut whitelist: Vec<String> = category_ids.to_vec();
    if os_only && !whitelist.iter().any(|id| id.eq_ignore_ascii_case(OS_UPDATES_CATEGORY_ID)) {
        whitelist.push(OS_UPDATES_CATEGORY_ID.to_string());
    }
    whitelist
}

/// Host OS-update surface.
#[async_trait]
pub trait UpdateEngine: Send + Sync {
    /// Search for applicable updates.
    async fn search(
        &self,
        query: &str,
        timeout: Duration,
    ) -> Result<Vec<AvailableUpdate>, EngineError>;

    /// Accept the EULA of one update.
    async fn accept_eula(&self, update: &AvailableUpdate) -> Result<(), EngineError>;

    /// Download a set of updates.
    async fn download(
        &self,
        updates: &[AvailableUpdate],
        timeout: Duration,
    ) -> Result<EngineReport, EngineError>;

    /// Install a set of updates.
    async fn install(
        &self,
        updates: &[AvailableUpdate],
        timeout: Duration,
    ) -> Result<EngineReport, EngineError>;

    /// Whether the host has a reboot pending from installed updates.
    async fn reboot_required(&self) -> Result<bool, EngineError>;

    /// Cooperatively abort the in-flight operation.
    async fn request_abort(&self);

    /// Apply the host's notify-before-download policy so the OS does not
    /// install updates behind the agent's back.
    async fn apply_notify_before_download_policy(&self) -> Result<(), EngineError>;
}

/// Mock engine for testing and development.
pub struct MockEngine {
    updates: Mutex<Vec<AvailableUpdate>>,
    install_outcome: Mutex<UpdateOperationOutcome>,
    reboot_required: AtomicBool,
    search_failures_remaining: AtomicU32,
    install_failures_remaining: AtomicU32,
    install_delay: Mutex<Duration>,
    accepted_eulas: Mutex<HashSet<String>>,
    abort_requested: AtomicBool,
    policy_applied: AtomicBool,
    pub search_calls: AtomicU32,
    pub download_calls: AtomicU32,
    pub install_calls: AtomicU32,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
            install_outcome: Mutex::new(UpdateOperationOutcome::Succeeded),
            reboot_required: AtomicBool::new(false),
            search_failures_remaining: AtomicU32::new(0),
            install_failures_remaining: AtomicU32::new(0),
            install_delay: Mutex::new(Duration::ZERO),
            accepted_eulas: Mutex::new(HashSet::new()),
            abort_requested: AtomicBool::new(false),
            policy_applied: AtomicBool::new(false),
            search_calls: AtomicU32::new(0),
            download_calls: AtomicU32::new(0),
            install_calls: AtomicU32::new(0),
        }
    }

    /// Configure what the next searches return.
    pub fn with_updates(self, updates: Vec<AvailableUpdate>) -> Self {
        *self.updates.lock().expect("mock lock") = updates;
        self
    }

    pub fn set_updates(&self, updates: Vec<AvailableUpdate>) {
        *self.updates.lock().expect("mock lock") = updates;
    }

    pub fn set_install_outcome(&self, outcome: UpdateOperationOutcome) {
        *self.install_outcome.lock().expect("mock lock") = outcome;
    }

    pub fn set_reboot_required(&self, required: bool) {
        self.reboot_required.store(required, Ordering::SeqCst);
    }

    /// Make the next `n` searches fail before succeeding.
    pub fn fail_next_searches(&self, n: u32) {
        self.search_failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_installs(&self, n: u32) {
        self.install_failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Make installs take this long, so tests can interrupt one in flight.
    pub fn set_install_delay(&self, delay: Duration) {
        *self.install_delay.lock().expect("mock lock") = delay;
    }

    pub fn abort_was_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn policy_was_applied(&self) -> bool {
        self.policy_applied.load(Ordering::SeqCst)
    }

    pub fn accepted_eulas(&self) -> HashSet<String> {
        self.accepted_eulas.lock().expect("mock lock").clone()
    }

    fn report_for(&self, updates: &[AvailableUpdate], outcome: UpdateOperationOutcome) -> EngineReport {
        let details = updates
            .iter()
            .map(|u| UpdateDetail {
                update_id: u.update_id.clone(),
                title: u.title.clone(),
                description: u.description.clone(),
                result_code: Some(outcome),
                hresult: 0,
            })
            .collect();
        EngineReport {
            outcome,
            details,
            reboot_required: self.reboot_required.load(Ordering::SeqCst),
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateEngine for MockEngine {
    async fn search(
        &self,
        query: &str,
        _timeout: Duration,
    ) -> Result<Vec<AvailableUpdate>, EngineError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if decrement_if_positive(&self.search_failures_remaining) {
            return Err(EngineError::Operation("mock search failure".to_string()));
        }
        let updates = self.updates.lock().expect("mock lock").clone();
        debug!(query, count = updates.len(), "[MOCK] Search complete");
        Ok(updates)
    }

    async fn accept_eula(&self, update: &AvailableUpdate) -> Result<(), EngineError> {
        self.accepted_eulas
            .lock()
            .expect("mock lock")
            .insert(update.update_id.clone());
        Ok(())
    }

    async fn download(
        &self,
        updates: &[AvailableUpdate],
        _timeout: Duration,
    ) -> Result<EngineReport, EngineError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        info!(count = updates.len(), "[MOCK] Download complete");
        Ok(self.report_for(updates, UpdateOperationOutcome::Succeeded))
    }

    async fn install(
        &self,
        updates: &[AvailableUpdate],
        _timeout: Duration,
    ) -> Result<EngineReport, EngineError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.install_delay.lock().expect("mock lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if decrement_if_positive(&self.install_failures_remaining) {
            return Err(EngineError::Operation("mock install failure".to_string()));
        }
        let outcome = *self.install_outcome.lock().expect("mock lock");
        info!(count = updates.len(), outcome = %outcome, "[MOCK] Install complete");
        Ok(self.report_for(updates, outcome))
    }

    async fn reboot_required(&self) -> Result<bool, EngineError> {
        Ok(self.reboot_required.load(Ordering::SeqCst))
    }

    async fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    async fn apply_notify_before_download_policy(&self) -> Result<(), EngineError> {
        self.policy_applied.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn decrement_if_positive(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
}

/// Build a simple test update.
pub fn test_update(id: &str, title: &str) -> AvailableUpdate {
    AvailableUpdate {
        update_id: id.to_string(),
        title: title.to_string(),
        description: format!("{title} description"),
        categories: Vec::new(),
        eula_accepted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_hresult() {
        assert_eq!(outcome_from_hresult(0), UpdateOperationOutcome::Succeeded);
        assert_eq!(
            outcome_from_hresult(NO_UPDATES_HRESULT),
            UpdateOperationOutcome::Succeeded
        );
        assert_eq!(outcome_from_hresult(-2145124316), UpdateOperationOutcome::Failed);
    }

    #[test]
    fn test_category_match_walks_parents() {
        let root = UpdateCategory::root("root-id", "Updates");
        let child = UpdateCategory::child_of("child-id", "Security Updates", root);
        let mut update = test_update("u1", "KB1");
        update.categories = vec![child];

        assert!(category_matches(&update, &[]));
        assert!(category_matches(&update, &["child-id".to_string()]));
        assert!(category_matches(&update, &["ROOT-ID".to_string()]));
        assert!(!category_matches(&update, &["other".to_string()]));
    }

    #[test]
    fn test_effective_whitelist_appends_os_guid() {
        let whitelist = effective_whitelist(&["aaa".to_string()], true);
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains(&OS_UPDATES_CATEGORY_ID.to_string()));

        let unchanged = effective_whitelist(&["aaa".to_string()], false);
        assert_eq!(unchanged, vec!["aaa".to_string()]);

        // Already present: no duplicate.
        let existing = effective_whitelist(&[OS_UPDATES_CATEGORY_ID.to_uppercase()], true);
        assert_eq!(existing.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_injection() {
        let engine = MockEngine::new().with_updates(vec![test_update("u1", "KB1")]);
        engine.fail_next_searches(2);

        assert!(engine.search("q", Duration::from_secs(1)).await.is_err());
        assert!(engine.search("q", Duration::from_secs(1)).await.is_err());
        let found = engine.search("q", Duration::from_secs(1)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(engine.search_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mock_install_outcome_and_details() {
        let updates = vec![test_update("u1", "KB1"), test_update("u2", "KB2")];
        let engine = MockEngine::new();
        engine.set_install_outcome(UpdateOperationOutcome::SucceededWithErrors);
        engine.set_reboot_required(true);

        let report = engine.install(&updates, Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.outcome, UpdateOperationOutcome::SucceededWithErrors);
        assert_eq!(report.details.len(), 2);
        assert!(report.reboot_required);
    }
}
