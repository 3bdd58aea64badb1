//! One pass of the update state machine.
//!
//! The cycle is entered with the node's current sub-state as read from the
//! coordinator and resumes at the matching point:
//!
//! - `None` / `OperationCompleted`: full pass (search, download, wait for
//!   approval, install, reboot decision)
//! - `DownloadCompleted`: resume at the approval wait
//! - `InstallationApproved`: resume at install
//! - `InstallationInProgress`: re-search; empty results mean the install
//!   finished and the status update was lost, so the pass ends and the next
//!   cycle resolves it
//! - `InstallationCompleted`: resume at the reboot decision
//! - `RestartCompleted` / `RestartNotNeeded`: complete the operation
//!
//! Installation retries respect the remaining budget derived from the
//! approval timestamp so an overrunning node cannot block approval of other
//! nodes indefinitely.

use chrono::{DateTime, Utc};
use pos_model::{
    ExecutorDataForNtService, ExecutorSubState, OperationResult, OperationStateResponse,
    OperationType, UpdateDetail, UpdateInstallationRequest, UpdateOperationOutcome,
    UpdateSearchAndDownloadRequest,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::{CoordinatorChannel, RpcError};
use crate::engine::{
    category_matches, effective_whitelist, AvailableUpdate, EngineError, EngineReport, UpdateEngine,
};
use crate::os::OsControl;
use crate::settings::NodeSettings;
use crate::workdir::WorkDirError;

/// Errors that end a cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("coordinator abandoned the operation while waiting for approval")]
    ApprovalLost,

    #[error("shutdown requested")]
    Shutdown,

    #[error(transparent)]
    WorkDir(#[from] WorkDirError),
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEnd {
    /// The operation ran to completion (including "nothing to do").
    Completed,

    /// An OS restart was requested; on a real host the process dies here.
    RestartRequested,

    /// The node is still waiting for its requested restart; nothing was done.
    WaitingRestart,
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub end: CycleEnd,

    /// Whether the next attempt should be pulled forward.
    pub reschedule_needed: bool,
}

impl CycleOutcome {
    fn completed(reschedule_needed: bool) -> Self {
        Self {
            end: CycleEnd::Completed,
            reschedule_needed,
        }
    }
}

/// One update pass over the nested state machine.
pub struct UpdateCycle<'a> {
    pub engine: &'a dyn UpdateEngine,
    pub channel: &'a dyn CoordinatorChannel,
    pub os: &'a dyn OsControl,
    pub settings: &'a NodeSettings,
    pub checkpoints: &'a CheckpointStore,
    pub node_name: &'a str,
    pub application_uri: &'a str,
    pub shutdown: watch::Receiver<bool>,
}

impl<'a> UpdateCycle<'a> {
    /// Run the cycle from the given coordinator-observed state.
    pub async fn run(&mut self, state: OperationStateResponse) -> Result<CycleOutcome, CycleError> {
        use ExecutorSubState::*;

        info!(entry = %state.sub_state, "Starting update cycle");
        match state.sub_state {
            None | OperationCompleted | OperationAborted => self.full_pass().await,
            DownloadCompleted => {
                let approved = self.wait_for_approval().await?;
                self.install_phase(approved).await
            }
            InstallationApproved => self.install_phase(state.executor_data).await,
            InstallationInProgress => self.resume_interrupted_install(state.executor_data).await,
            InstallationCompleted => {
                let required = self.engine.reboot_required().await?;
                self.reboot_decision(required, UpdateOperationOutcome::Succeeded).await
            }
            RestartCompleted | RestartNotNeeded => self.complete_operation(false).await,
            RestartRequested => Ok(CycleOutcome {
                end: CycleEnd::WaitingRestart,
                reschedule_needed: false,
            }),
        }
    }

    async fn full_pass(&mut self) -> Result<CycleOutcome, CycleError> {
        let started_at = Utc::now();
        self.checkpoints.save_start_timestamp(started_at)?;

        let found = self.search_with_retries().await?;
        let eligible = self.filter_and_accept(found).await?;

        if eligible.is_empty() {
            info!("Search found nothing applicable, completing the cycle");
            let result = OperationResult::empty_search(
                self.node_name,
                started_at,
                Utc::now(),
                &self.settings.wu_query,
                &self.settings.frequency.to_string(),
            );
            self.channel
                .update_search_and_download_status(UpdateSearchAndDownloadRequest {
                    application_uri: self.application_uri.to_string(),
                    sub_state: ExecutorSubState::OperationCompleted,
                    result: Some(result),
                    installation_timeout_minutes: self.settings.wu_operation_timeout_minutes(),
                })
                .await?;
            return Ok(CycleOutcome::completed(false));
        }

        let report = self.download_with_retries(&eligible).await?;
        let download_ok = report.outcome == UpdateOperationOutcome::Succeeded;
        let result = self.result_from(
            OperationType::SearchAndDownload,
            started_at,
            report.outcome,
            report.details,
            false,
        );
        self.channel
            .update_search_and_download_status(UpdateSearchAndDownloadRequest {
                application_uri: self.application_uri.to_string(),
                sub_state: ExecutorSubState::DownloadCompleted,
                result: Some(result),
                installation_timeout_minutes: self.settings.wu_operation_timeout_minutes(),
            })
            .await?;

        let approved = self.wait_for_approval().await?;
        let mut outcome = self.install_phase_with(approved, &eligible).await?;
        outcome.reschedule_needed |= !download_ok;
        Ok(outcome)
    }

    /// Re-enter after a crash mid-install.
    async fn resume_interrupted_install(
        &mut self,
        approved: Option<ExecutorDataForNtService>,
    ) -> Result<CycleOutcome, CycleError> {
        let found = self.search_with_retries().await?;
        let eligible = self.filter_and_accept(found).await?;
        if eligible.is_empty() {
            // The install most likely finished and the completion update was
            // lost with the process; the next cycle observes the final state.
            info!("No updates pending after an interrupted install; ending the pass");
            return Ok(CycleOutcome::completed(false));
        }
        let report = self.run_install(approved, &eligible).await?;
        self.finish_install(report).await
    }

    async fn install_phase(
        &mut self,
        approved: Option<ExecutorDataForNtService>,
    ) -> Result<CycleOutcome, CycleError> {
        // A fresh process resumes here without an in-memory download set;
        // ask the engine again for what is pending.
        let found = self.search_with_retries().await?;
        let eligible = self.filter_and_accept(found).await?;
        self.install_phase_with(approved, &eligible).await
    }

    async fn install_phase_with(
        &mut self,
        approved: Option<ExecutorDataForNtService>,
        updates: &[AvailableUpdate],
    ) -> Result<CycleOutcome, CycleError> {
        self.channel
            .update_installation_status(UpdateInstallationRequest {
                application_uri: self.application_uri.to_string(),
                sub_state: ExecutorSubState::InstallationInProgress,
                result: None,
            })
            .await?;

        let report = self.run_install(approved, updates).await?;
        self.finish_install(report).await
    }

    async fn finish_install(&mut self, report: EngineReport) -> Result<CycleOutcome, CycleError> {
        let started_at = self.checkpoints.load_start_timestamp().unwrap_or_else(Utc::now);
        let outcome = report.outcome;
        let result = self.result_from(
            OperationType::Installation,
            started_at,
            outcome,
            report.details,
            report.reboot_required,
        );
        self.channel
            .update_installation_status(UpdateInstallationRequest {
                application_uri: self.application_uri.to_string(),
                sub_state: ExecutorSubState::InstallationCompleted,
                result: Some(result),
            })
            .await?;

        self.reboot_decision(report.reboot_required, outcome).await
    }

    /// Post-install reboot decision and operation completion.
    async fn reboot_decision(
        &mut self,
        reboot_required: bool,
        outcome: UpdateOperationOutcome,
    ) -> Result<CycleOutcome, CycleError> {
        if reboot_required {
            self.channel
                .update_installation_status(UpdateInstallationRequest {
                    application_uri: self.application_uri.to_string(),
                    sub_state: ExecutorSubState::RestartRequested,
                    result: None,
                })
                .await?;
            self.os
                .request_restart()
                .await
                .map_err(|e| CycleError::Engine(EngineError::Operation(e.to_string())))?;
            info!("Restart requested; the operation completes after reboot");
            return Ok(CycleOutcome {
                end: CycleEnd::RestartRequested,
                reschedule_needed: false,
            });
        }

        self.channel
            .update_installation_status(UpdateInstallationRequest {
                application_uri: self.application_uri.to_string(),
                sub_state: ExecutorSubState::RestartNotNeeded,
                result: None,
            })
            .await?;
        self.complete_operation(outcome.needs_reschedule()).await
    }

    async fn complete_operation(
        &mut self,
        reschedule_needed: bool,
    ) -> Result<CycleOutcome, CycleError> {
        self.channel
            .update_installation_status(UpdateInstallationRequest {
                application_uri: self.application_uri.to_string(),
                sub_state: ExecutorSubState::OperationCompleted,
                result: None,
            })
            .await?;
        info!("Update operation completed");
        Ok(CycleOutcome::completed(reschedule_needed))
    }

    // ------------------------------------------------------------------
    // External calls with retries
    // ------------------------------------------------------------------

    async fn search_with_retries(&mut self) -> Result<Vec<AvailableUpdate>, CycleError> {
        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.settings.operation_retry_count.max(1) {
            if attempt > 0 {
                self.sleep_or_shutdown(self.settings.delay_between_retries).await?;
            }
            match self
                .engine
                .search(&self.settings.wu_query, self.settings.wu_operation_timeout)
                .await
            {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(attempt, error = %e, "Update search failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::Operation("search never attempted".to_string()))
            .into())
    }

    async fn download_with_retries(
        &mut self,
        updates: &[AvailableUpdate],
    ) -> Result<EngineReport, CycleError> {
        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.settings.operation_retry_count.max(1) {
            if attempt > 0 {
                self.sleep_or_shutdown(self.settings.delay_between_retries).await?;
            }
            match self
                .engine
                .download(updates, self.settings.wu_operation_timeout)
                .await
            {
                Ok(report) => return Ok(report),
                Err(e) => {
                    warn!(attempt, error = %e, "Update download failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::Operation("download never attempted".to_string()))
            .into())
    }

    /// Install with retries, each attempt bounded by the remaining budget.
    async fn run_install(
        &mut self,
        approved: Option<ExecutorDataForNtService>,
        updates: &[AvailableUpdate],
    ) -> Result<EngineReport, CycleError> {
        let approved = approved.or_else(|| self.checkpoints.load_executor_snapshot());

        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.settings.operation_retry_count.max(1) {
            if attempt > 0 {
                self.sleep_or_shutdown(self.settings.delay_between_retries).await?;
            }

            let budget = remaining_install_budget(
                approved.as_ref(),
                self.settings.wu_operation_timeout,
                Utc::now(),
            );
            if budget.is_zero() {
                warn!("Installation budget exhausted; attempting with zero budget");
            }
            let attempt_timeout = budget.min(self.settings.wu_operation_timeout);

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                installed = self.engine.install(updates, attempt_timeout) => {
                    match installed {
                        Ok(report) => return Ok(report),
                        Err(e) => {
                            warn!(attempt, error = %e, "Update installation failed");
                            last_error = Some(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Abort cooperatively and record the aborted attempt.
                        self.engine.request_abort().await;
                        let started_at =
                            self.checkpoints.load_start_timestamp().unwrap_or_else(Utc::now);
                        let result = self.result_from(
                            OperationType::Installation,
                            started_at,
                            UpdateOperationOutcome::Aborted,
                            Vec::new(),
                            false,
                        );
                        let _ = self.channel.update_operation_result(result).await;
                        return Err(CycleError::Shutdown);
                    }
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| EngineError::Operation("install never attempted".to_string()))
            .into())
    }

    /// Poll the coordinator until installation is approved.
    async fn wait_for_approval(
        &mut self,
    ) -> Result<Option<ExecutorDataForNtService>, CycleError> {
        loop {
            let boot_time = self.os.system_boot_time().await.ok();
            let state = self.channel.get_operation_state(boot_time).await?;
            match state.sub_state {
                ExecutorSubState::InstallationApproved => {
                    info!("Installation approved");
                    return Ok(state.executor_data);
                }
                ExecutorSubState::DownloadCompleted => {
                    self.sleep_or_shutdown(self.settings.delay_between_retries).await?;
                }
                other => {
                    // None / OperationCompleted here means the coordinator
                    // abandoned the task while we waited.
                    warn!(sub_state = %other, "Approval wait ended unexpectedly");
                    return Err(CycleError::ApprovalLost);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Apply category filtering and EULA acceptance to the search results.
    async fn filter_and_accept(
        &mut self,
        found: Vec<AvailableUpdate>,
    ) -> Result<Vec<AvailableUpdate>, CycleError> {
        let whitelist = effective_whitelist(
            &self.settings.category_ids,
            self.settings.install_os_only_updates,
        );

        let mut eligible = Vec::new();
        for update in found {
            if !category_matches(&update, &whitelist) {
                continue;
            }
            if self.settings.accept_eula && !update.eula_accepted {
                self.engine.accept_eula(&update).await?;
            }
            eligible.push(update);
        }
        Ok(eligible)
    }

    fn result_from(
        &self,
        operation_type: OperationType,
        started_at: DateTime<Utc>,
        outcome: UpdateOperationOutcome,
        details: Vec<UpdateDetail>,
        reboot_required: bool,
    ) -> OperationResult {
        OperationResult {
            node_name: self.node_name.to_string(),
            operation_time: Utc::now(),
            operation_start_time: started_at,
            operation_type,
            operation_result: outcome,
            update_details: details,
            windows_update_query: self.settings.wu_query.clone(),
            windows_update_frequency: self.settings.frequency.to_string(),
            reboot_required,
        }
    }

    async fn sleep_or_shutdown(&mut self, duration: std::time::Duration) -> Result<(), CycleError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.changed() => {
                if *self.shutdown.borrow() {
                    Err(CycleError::Shutdown)
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Remaining installation budget: the per-task timeout minus total elapsed
/// minutes since approval. Never negative.
pub fn remaining_install_budget(
    approved: Option<&ExecutorDataForNtService>,
    fallback: std::time::Duration,
    now: DateTime<Utc>,
) -> std::time::Duration {
    let Some(data) = approved else {
        return fallback;
    };
    let Some(approved_at) = data.approved_at else {
        return fallback;
    };
    // Total elapsed minutes, not the wall-clock minutes field: installs that
    // span more than an hour must not regain budget.
    let elapsed_minutes = (now - approved_at).num_minutes();
    let remaining = data.executor_timeout_minutes - elapsed_minutes;
    if remaining <= 0 {
        std::time::Duration::ZERO
    } else {
        std::time::Duration::from_secs(remaining as u64 * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_remaining_budget_counts_total_minutes() {
        let now = Utc::now();
        let data = ExecutorDataForNtService {
            approved_at: Some(now - Duration::minutes(75)),
            executor_timeout_minutes: 90,
        };
        let remaining = remaining_install_budget(Some(&data), std::time::Duration::from_secs(1), now);
        assert_eq!(remaining, std::time::Duration::from_secs(15 * 60));

        // 75 minutes elapsed must not read as 15 wall-clock "minutes field";
        // past the budget the remaining time is exactly zero.
        let data = ExecutorDataForNtService {
            approved_at: Some(now - Duration::minutes(95)),
            executor_timeout_minutes: 90,
        };
        let remaining = remaining_install_budget(Some(&data), std::time::Duration::from_secs(1), now);
        assert_eq!(remaining, std::time::Duration::ZERO);
    }

    #[test]
    fn test_remaining_budget_fallback_without_approval_data() {
        let fallback = std::time::Duration::from_secs(90 * 60);
        assert_eq!(remaining_install_budget(None, fallback, Utc::now()), fallback);

        let data = ExecutorDataForNtService {
            approved_at: None,
            executor_timeout_minutes: 90,
        };
        assert_eq!(
            remaining_install_budget(Some(&data), fallback, Utc::now()),
            fallback
        );
    }
}
