//! The agent's outer loop and scheduling tick.
//!
//! On start the agent waits for its settings file, clears staging, loads
//! settings defensively, applies the host update policy, and then ticks every
//! five minutes. Each tick re-reads cluster-side state and the on-disk
//! checkpoint, so a restarted or rebooted process resumes exactly where the
//! previous one stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pos_model::{
    ApplicationDeployedStatus, ExecutorSubState, HealthState, ReportHealthRequest,
    UpdateSearchAndDownloadRequest,
};
use pos_schedule::{next_schedule, CheckpointData};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::CoordinatorChannel;
use crate::config::Config;
use crate::cycle::{CycleEnd, CycleError, UpdateCycle};
use crate::engine::{EngineError, UpdateEngine};
use crate::os::OsControl;
use crate::settings::{self, NodeSettings};
use crate::workdir::WorkDir;

/// Delay between retries of startup work (settings load, policy apply).
const STARTUP_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Errors that end the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A host library the update engine needs is missing; the agent exits
    /// with the dedicated code so the platform restarts it.
    #[error("fatal environment error: {0}")]
    FatalEnvironment(String),

    #[error("shutdown requested")]
    Shutdown,
}

/// What a scheduling step decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep ticking.
    Continue,

    /// The deployment is gone; the service tore itself down.
    Exit,
}

/// The per-node update agent.
pub struct Agent {
    config: Config,
    workdir: WorkDir,
    checkpoints: CheckpointStore,
    engine: Arc<dyn UpdateEngine>,
    channel: Arc<dyn CoordinatorChannel>,
    os: Arc<dyn OsControl>,
    settings: NodeSettings,
}

impl Agent {
    pub fn new(
        config: Config,
        workdir: WorkDir,
        engine: Arc<dyn UpdateEngine>,
        channel: Arc<dyn CoordinatorChannel>,
        os: Arc<dyn OsControl>,
    ) -> Self {
        let checkpoints = CheckpointStore::new(workdir.clone());
        Self {
            config,
            workdir,
            checkpoints,
            engine,
            channel,
            os,
            settings: NodeSettings::default(),
        }
    }

    /// Current effective settings.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Run the agent until shutdown or teardown.
    #[instrument(skip(self, shutdown), fields(node = %self.config.node_name))]
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        info!("Starting node update agent");

        self.startup(&mut shutdown).await?;

        let step_shutdown = shutdown.clone();
        let mut interval = tokio::time::interval(self.config.scheduler_tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_scheduling_step(&step_shutdown).await {
                        Ok(StepOutcome::Continue) => {}
                        Ok(StepOutcome::Exit) => return Ok(()),
                        Err(AgentError::Shutdown) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Node agent shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Startup sequence: settings file, staging, policy, first status fact.
    async fn startup(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), AgentError> {
        // 1. Wait until the settings file exists.
        while !self.workdir.settings_file().exists() {
            info!(path = %self.workdir.settings_file().display(), "Waiting for settings file");
            sleep_or_shutdown(shutdown, Duration::from_secs(5)).await?;
        }

        // 2. Clear write-then-rename staging.
        if let Err(e) = self.workdir.clear_temp_dir() {
            warn!(error = %e, "Failed to clear the temp directory");
        }

        // 3. Load settings defensively; keep retrying until something parses.
        loop {
            match settings::load_with_fallback(&self.workdir) {
                Ok(loaded) => {
                    self.settings = loaded;
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Settings unusable, retrying");
                    self.report_settings_warning(&e.to_string()).await;
                    sleep_or_shutdown(shutdown, STARTUP_RETRY_DELAY).await?;
                }
            }
        }

        // 4. Keep the host from installing updates behind our back.
        if self.settings.disable_auto_update {
            loop {
                match self.engine.apply_notify_before_download_policy().await {
                    Ok(()) => break,
                    Err(EngineError::MissingComponent(what)) => {
                        return Err(AgentError::FatalEnvironment(what))
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to apply the update policy, retrying");
                        sleep_or_shutdown(shutdown, STARTUP_RETRY_DELAY).await?;
                    }
                }
            }
        }

        // 5. Initial checkpoint and status fact.
        let checkpoint = self.checkpoints.load();
        if checkpoint.scheduling_time.is_none() && !checkpoint.reschedule_needed {
            let fresh =
                CheckpointData::fresh(next_schedule(&self.settings.frequency, Utc::now()));
            if let Err(e) = self.checkpoints.save(&fresh) {
                warn!(error = %e, "Failed to write the initial checkpoint");
            }
        }
        self.report_operation_status().await;

        Ok(())
    }

    /// One scheduling tick.
    pub async fn run_scheduling_step(
        &mut self,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<StepOutcome, AgentError> {
        // a. The deployment must still exist.
        match self
            .channel
            .application_deployed_status(&self.config.application_uri)
            .await
        {
            Ok(ApplicationDeployedStatus::Deployed) => {}
            Ok(ApplicationDeployedStatus::NotFound) => {
                warn!("Deployed application is gone; tearing down the agent service");
                if let Err(e) = self.os.tear_down_service().await {
                    error!(error = %e, "Service teardown failed");
                }
                return Ok(StepOutcome::Exit);
            }
            Err(e) => {
                warn!(error = %e, "Deployed-status check failed, skipping tick");
                return Ok(StepOutcome::Continue);
            }
        }

        // b. Read the cluster-side view of this node.
        let boot_time = self.os.system_boot_time().await.ok();
        let state = match self.channel.get_operation_state(boot_time).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Operation-state read failed, skipping tick");
                return Ok(StepOutcome::Continue);
            }
        };

        // c. A requested restart that has not happened yet: wait.
        if state.sub_state == ExecutorSubState::RestartRequested {
            info!("Restart still pending, waiting");
            return Ok(StepOutcome::Continue);
        }

        // d. Reboot finished: finalize the operation and reschedule.
        if state.sub_state == ExecutorSubState::RestartCompleted {
            info!("Reboot complete, finalizing the operation");
            match self.run_cycle(state, shutdown).await? {
                StepOutcome::Exit => return Ok(StepOutcome::Exit),
                StepOutcome::Continue => {}
            }
            return Ok(StepOutcome::Continue);
        }

        // e. Reschedule bookkeeping.
        let mut checkpoint = self.checkpoints.load();
        if checkpoint.reschedule_needed {
            checkpoint.reschedule_count += 1;
            if checkpoint.reschedule_count > self.settings.reschedule_count {
                warn!(
                    count = checkpoint.reschedule_count,
                    limit = self.settings.reschedule_count,
                    "Reschedule budget exhausted, abandoning the operation"
                );
                self.abort_operation().await;
                checkpoint =
                    CheckpointData::fresh(next_schedule(&self.settings.frequency, Utc::now()));
            } else {
                checkpoint.reschedule_needed = false;
                // Assign the advanced time; dropping the result here would
                // retry at the stale instant forever.
                let now = Utc::now();
                let base = checkpoint.scheduling_time.map_or(now, |t| t.max(now));
                checkpoint.scheduling_time =
                    Some(base + chrono::Duration::seconds(self.settings.reschedule_time.as_secs() as i64));
                info!(
                    next = %checkpoint.scheduling_time.unwrap(),
                    count = checkpoint.reschedule_count,
                    "Rescheduled after a failed cycle"
                );
            }
            if let Err(e) = self.checkpoints.save(&checkpoint) {
                warn!(error = %e, "Failed to persist the reschedule checkpoint");
            }
        }

        // f. Pick up replaced settings.
        match settings::settings_changed(&self.workdir) {
            Ok(true) => {
                info!("Settings file changed, reloading");
                match settings::load_with_fallback(&self.workdir) {
                    Ok(loaded) => {
                        self.settings = loaded;
                        checkpoint = CheckpointData::fresh(next_schedule(
                            &self.settings.frequency,
                            Utc::now(),
                        ));
                        if let Err(e) = self.checkpoints.save(&checkpoint) {
                            warn!(error = %e, "Failed to persist the reloaded checkpoint");
                        }
                        self.report_operation_status().await;
                    }
                    Err(e) => {
                        // Previous known-good settings stay in effect.
                        warn!(error = %e, "Replaced settings rejected, keeping the previous ones");
                        self.report_settings_warning(&e.to_string()).await;
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Settings change detection failed"),
        }

        // g. Run the cycle when the scheduled time has arrived.
        let due = checkpoint
            .scheduling_time
            .is_some_and(|at| at <= Utc::now());
        if due {
            return self.run_cycle(state, shutdown).await;
        }

        // Housekeeping while idle.
        if let Err(e) = self.workdir.trim_logs(self.config.logs_disk_quota_bytes) {
            warn!(error = %e, "Log trim failed");
        }

        Ok(StepOutcome::Continue)
    }

    /// Run one update cycle and persist its outcome.
    async fn run_cycle(
        &mut self,
        state: pos_model::OperationStateResponse,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<StepOutcome, AgentError> {
        let mut cycle = UpdateCycle {
            engine: self.engine.as_ref(),
            channel: self.channel.as_ref(),
            os: self.os.as_ref(),
            settings: &self.settings,
            checkpoints: &self.checkpoints,
            node_name: &self.config.node_name,
            application_uri: &self.config.application_uri,
            shutdown: shutdown.clone(),
        };

        let now = Utc::now();
        match cycle.run(state).await {
            Ok(outcome) => {
                match outcome.end {
                    CycleEnd::RestartRequested => {
                        // The process ends with the host; nothing to persist,
                        // the checkpoint is rebuilt after the reboot.
                        info!("Cycle ended in a restart request");
                    }
                    CycleEnd::WaitingRestart => {}
                    CycleEnd::Completed => {
                        let mut checkpoint = if outcome.reschedule_needed {
                            let mut current = self.checkpoints.load();
                            current.reschedule_needed = true;
                            current
                        } else {
                            CheckpointData::fresh(next_schedule(&self.settings.frequency, now))
                        };
                        checkpoint.last_attempted = Some(now);
                        if let Err(e) = self.checkpoints.save(&checkpoint) {
                            warn!(error = %e, "Failed to persist the post-cycle checkpoint");
                        }
                        self.report_operation_status().await;
                    }
                }
                Ok(StepOutcome::Continue)
            }
            Err(CycleError::Shutdown) => Err(AgentError::Shutdown),
            Err(CycleError::Engine(EngineError::MissingComponent(what))) => {
                Err(AgentError::FatalEnvironment(what))
            }
            Err(e) => {
                error!(error = %e, "Update cycle failed, flagging a reschedule");
                let mut checkpoint = self.checkpoints.load();
                checkpoint.reschedule_needed = true;
                checkpoint.last_attempted = Some(now);
                if let Err(e) = self.checkpoints.save(&checkpoint) {
                    warn!(error = %e, "Failed to persist the failure checkpoint");
                }
                self.report_cycle_warning(&e.to_string()).await;
                Ok(StepOutcome::Continue)
            }
        }
    }

    /// Abandon the in-flight operation after the reschedule budget ran out.
    async fn abort_operation(&self) {
        let request = UpdateSearchAndDownloadRequest {
            application_uri: self.config.application_uri.clone(),
            sub_state: ExecutorSubState::OperationAborted,
            result: None,
            installation_timeout_minutes: 0,
        };
        if let Err(e) = self.channel.update_search_and_download_status(request).await {
            warn!(error = %e, "Failed to abandon the operation");
        }
    }

    /// Publish the agent's scheduling status against its own service.
    async fn report_operation_status(&self) {
        let checkpoint = self.checkpoints.load();
        let description = format!(
            "last attempted: {}; next scheduled: {}",
            checkpoint
                .last_attempted
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            checkpoint
                .scheduling_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "disabled".to_string()),
        );
        self.report_health("WUOperationStatus", &description, HealthState::Ok).await;
    }

    async fn report_settings_warning(&self, description: &str) {
        self.report_health("SettingsValidation", description, HealthState::Warning).await;
    }

    async fn report_cycle_warning(&self, description: &str) {
        self.report_health("WUOperationStatus", description, HealthState::Warning).await;
    }

    async fn report_health(&self, property: &str, description: &str, state: HealthState) {
        let request = ReportHealthRequest {
            application_uri: self.config.node_service_uri.clone(),
            property: property.to_string(),
            description: description.to_string(),
            state,
            ttl_seconds: None,
            readiness_deadline_seconds: Some(self.settings.operation_timeout.as_secs() as i64),
        };
        if let Err(e) = self.channel.report_health(request).await {
            warn!(property, error = %e, "Failed to publish agent health fact");
        }
    }
}

async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    duration: Duration,
) -> Result<(), AgentError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = shutdown.changed() => {
            if *shutdown.borrow() {
                Err(AgentError::Shutdown)
            } else {
                Ok(())
            }
        }
    }
}
