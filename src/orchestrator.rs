//! The deployment state machine.
//!
//! A run walks `Idle → CheckingStatus → BackingUp → Stopping → Deploying →
//! Starting → HealthChecking` and ends in `Done`, detouring through
//! `RollingBack` when a failure happens after the new artifact is live and a
//! backup of the previous one exists. Every run yields exactly one
//! [`DeploymentOutcome`] and emits exactly one [`DeploymentEvent`].
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    process::ExitCode,
    time::{Duration, Instant},
};

use chrono::Local;
use strum_macros::{AsRefStr, Display, EnumIter};
use tracing::{debug, error, info, warn};

use crate::{
    artifact::{ArtifactStore, Backup},
    config::{BackupFailurePolicy, DeployConfig},
    error::{DeployError, Interrupted},
    health::{HealthStatus, Probe},
    lock::DeployLock,
    notify::{DeploymentEvent, EventStatus, Notifier},
    process::{ProcessControl, StopOutcome},
    wait::{CancelToken, ThreadWait, Wait},
};

/// States of a single deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumIter)]
pub enum DeployState {
    Idle,
    CheckingStatus,
    BackingUp,
    Stopping,
    Deploying,
    Starting,
    HealthChecking,
    RollingBack,
    Done,
}

impl DeployState {
    /// States whose failure leaves the new artifact live, so restoring the
    /// previous one is worthwhile.
    fn rollback_eligible(self) -> bool {
        matches!(self, DeployState::Starting | DeployState::HealthChecking)
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentOutcome {
    Success {
        elapsed: Duration,
    },
    Failed {
        reason: String,
        /// Whether the previous version was restored and restarted.
        rolled_back: bool,
    },
}

impl DeploymentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeploymentOutcome::Success { .. })
    }

    /// 0 on success, 1 on any failure, rolled back or not.
    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Mutable bookkeeping for one run.
#[derive(Debug)]
struct RunContext {
    started: Instant,
    backup: Option<Backup>,
    failure: Option<DeployError>,
    rollback_attempted: bool,
    outcome: Option<DeploymentOutcome>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            backup: None,
            failure: None,
            rollback_attempted: false,
            outcome: None,
        }
    }
}

/// Sequences the process, artifact, and health capabilities into a deployment.
pub struct Orchestrator<P, A, H, N> {
    config: DeployConfig,
    process: P,
    artifacts: A,
    prober: H,
    notifier: N,
    cancel: CancelToken,
    use_lock: bool,
}

impl<P, A, H, N> Orchestrator<P, A, H, N>
where
    P: ProcessControl,
    A: ArtifactStore,
    H: Probe,
    N: Notifier,
{
    pub fn new(config: DeployConfig, process: P, artifacts: A, prober: H, notifier: N) -> Self {
        Self {
            config,
            process,
            artifacts,
            prober,
            notifier,
            cancel: CancelToken::new(),
            use_lock: true,
        }
    }

    /// Observes `token` for operator interrupts.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Skips the per-location deploy lock.
    pub fn without_lock(mut self) -> Self {
        self.use_lock = false;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Executes one deployment attempt to completion.
    pub fn run(&self) -> DeploymentOutcome {
        let request = &self.config.request;
        info!("==================================================");
        info!("    AUTOMATED DEPLOYMENT");
        info!("    Application: {}", request.app_name);
        info!("    Version: {}", request.version);
        info!("    Time: {}", Local::now());
        info!("==================================================");

        let mut ctx = RunContext::new();

        let _lock = if self.use_lock {
            match DeployLock::acquire(&request.deploy_dir) {
                Ok(lock) => Some(lock),
                Err(err) => {
                    error!("{err}");
                    ctx.outcome = Some(DeploymentOutcome::Failed {
                        reason: err.to_string(),
                        rolled_back: false,
                    });
                    return self.finish(ctx);
                }
            }
        } else {
            None
        };

        let wait = ThreadWait::interruptible(self.cancel.clone());
        let mut state = DeployState::Idle;

        while state != DeployState::Done {
            let result = if state != DeployState::RollingBack && self.cancel.is_cancelled() {
                Err(DeployError::Interrupted(Interrupted))
            } else {
                catch_unwind(AssertUnwindSafe(|| self.step(state, &mut ctx, &wait)))
                    .unwrap_or_else(|panic| Err(DeployError::Unexpected(panic_message(panic))))
            };

            let next = match result {
                Ok(next) => next,
                Err(err) => self.fail(state, err, &mut ctx),
            };
            debug!("Transition {state} -> {next}");
            state = next;
        }

        self.finish(ctx)
    }

    /// Performs the action for `state` and returns the state to move to.
    fn step(
        &self,
        state: DeployState,
        ctx: &mut RunContext,
        wait: &dyn Wait,
    ) -> Result<DeployState, DeployError> {
        let config = &self.config;
        let request = &config.request;
        let timings = &config.timings;

        match state {
            DeployState::Idle => Ok(DeployState::CheckingStatus),

            DeployState::CheckingStatus => {
                info!("Checking if application is running...");
                if self.process.is_running(&config.process_pattern) {
                    warn!("{} is currently running", request.app_name);
                    Ok(DeployState::BackingUp)
                } else {
                    info!("{} is not running; skipping backup and stop", request.app_name);
                    Ok(DeployState::Deploying)
                }
            }

            DeployState::BackingUp => {
                info!("Creating backup of current version...");
                match self.artifacts.backup(
                    &request.deploy_dir,
                    &request.backup_dir,
                    &request.app_name,
                ) {
                    Ok(Some(backup)) => ctx.backup = Some(backup),
                    Ok(None) => warn!("No existing deployment to back up"),
                    Err(err) => match config.on_backup_failure {
                        BackupFailurePolicy::Continue => {
                            warn!("Backup failed ({err}), but continuing deployment...")
                        }
                        BackupFailurePolicy::Abort => return Err(err.into()),
                    },
                }
                Ok(DeployState::Stopping)
            }

            DeployState::Stopping => {
                info!("Stopping {}...", request.app_name);
                let outcome = self.process.stop(
                    &config.process_pattern,
                    timings.grace_period,
                    timings.force_delay,
                    wait,
                )?;
                match outcome {
                    StopOutcome::Uncertain if config.abort_on_uncertain_stop => {
                        Err(DeployError::StopUncertain(config.process_pattern.clone()))
                    }
                    StopOutcome::Uncertain => {
                        warn!(
                            "Could not confirm '{}' exited after SIGKILL; continuing",
                            config.process_pattern
                        );
                        Ok(DeployState::Deploying)
                    }
                    outcome => {
                        info!("Application {outcome}");
                        Ok(DeployState::Deploying)
                    }
                }
            }

            DeployState::Deploying => {
                info!("Deploying {} version {}...", request.app_name, request.version);
                self.artifacts
                    .deploy(&request.source_dir, &request.deploy_dir)?;
                Ok(DeployState::Starting)
            }

            DeployState::Starting => {
                self.process
                    .start(&config.start_command(), timings.settle_delay, wait)?;
                Ok(DeployState::HealthChecking)
            }

            DeployState::HealthChecking => {
                let policy = timings.probe_policy();
                debug!(
                    "Probing {} up to {} times (health check timeout {:?})",
                    config.health_check_url, policy.max_attempts, config.health_check_timeout
                );
                match self.prober.probe(&config.health_check_url, policy, wait)? {
                    HealthStatus::Healthy => {
                        let elapsed = ctx.started.elapsed();
                        info!("==================================================");
                        info!("DEPLOYMENT COMPLETED SUCCESSFULLY!");
                        info!("Time taken: {:.2} seconds", elapsed.as_secs_f64());
                        info!("==================================================");
                        ctx.outcome = Some(DeploymentOutcome::Success { elapsed });
                        Ok(DeployState::Done)
                    }
                    HealthStatus::Unhealthy => Err(DeployError::HealthCheckExhausted {
                        attempts: policy.max_attempts,
                    }),
                }
            }

            DeployState::RollingBack => {
                self.rollback(ctx);
                Ok(DeployState::Done)
            }

            DeployState::Done => Ok(DeployState::Done),
        }
    }

    /// Routes a failure in `state` to rollback or straight to `Done`.
    fn fail(&self, state: DeployState, err: DeployError, ctx: &mut RunContext) -> DeployState {
        let interrupted = err.is_interrupted();
        if interrupted {
            warn!("Deployment interrupted during {state}");
        } else {
            error!("{state} failed: {err}");
        }

        let wants_rollback =
            state != DeployState::RollingBack && (interrupted || state.rollback_eligible());

        if wants_rollback && ctx.backup.is_some() {
            ctx.failure = Some(err);
            return DeployState::RollingBack;
        }

        if wants_rollback {
            warn!("No backup available; cannot roll back");
        }
        ctx.outcome = Some(DeploymentOutcome::Failed {
            reason: err.to_string(),
            rolled_back: false,
        });
        DeployState::Done
    }

    /// Stops whatever is running, restores the backup, and restarts it. Runs to
    /// completion regardless of further interrupts.
    fn rollback(&self, ctx: &mut RunContext) {
        warn!("Initiating rollback to previous version...");
        ctx.rollback_attempted = true;

        let config = &self.config;
        let timings = &config.timings;
        let wait = ThreadWait::uninterruptible();

        match self.process.stop(
            &config.process_pattern,
            timings.grace_period,
            timings.force_delay,
            &wait,
        ) {
            Ok(outcome) => debug!("Failed version {outcome}"),
            Err(err) => warn!("Could not stop failed version ({err}); restoring anyway"),
        }

        let restored = match self
            .artifacts
            .restore(ctx.backup.as_ref(), &config.request.deploy_dir)
        {
            Ok(()) => true,
            Err(err) => {
                error!("Restore failed: {err}");
                false
            }
        };

        let restarted = restored
            && match self
                .process
                .start(&config.start_command(), timings.settle_delay, &wait)
            {
                Ok(()) => true,
                Err(err) => {
                    error!("Restarting previous version failed: {err}");
                    false
                }
            };

        let rolled_back = restored && restarted;
        if rolled_back {
            info!("Rollback completed successfully");
        } else {
            error!("Rollback failed! Manual intervention required");
        }

        let reason = ctx
            .failure
            .take()
            .map(|err| err.to_string())
            .unwrap_or_else(|| "deployment failed".to_string());
        ctx.outcome = Some(DeploymentOutcome::Failed { reason, rolled_back });
    }

    /// Emits the single notification for this run and hands back the outcome.
    fn finish(&self, mut ctx: RunContext) -> DeploymentOutcome {
        let outcome = ctx.outcome.take().unwrap_or_else(|| DeploymentOutcome::Failed {
            reason: "deployment ended without an outcome".to_string(),
            rolled_back: false,
        });

        let (status, message, rolled_back) = match &outcome {
            DeploymentOutcome::Success { elapsed } => (
                EventStatus::Success,
                format!("Deployment completed in {:.2}s", elapsed.as_secs_f64()),
                false,
            ),
            DeploymentOutcome::Failed {
                reason,
                rolled_back: true,
            } => (
                EventStatus::Failure,
                format!("{reason}; rolled back to previous version"),
                true,
            ),
            DeploymentOutcome::Failed { reason, .. } if ctx.rollback_attempted => (
                EventStatus::Failure,
                format!("{reason}; rollback failed, manual intervention required"),
                false,
            ),
            DeploymentOutcome::Failed { reason, .. } => {
                (EventStatus::Failure, reason.clone(), false)
            }
        };

        let request = &self.config.request;
        self.notifier.notify(&DeploymentEvent {
            status,
            app_name: request.app_name.clone(),
            version: request.version.clone(),
            timestamp: Local::now(),
            message,
            rolled_back,
        });

        outcome
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
