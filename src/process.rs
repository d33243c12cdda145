//! Locating, stopping, and starting the deployed application.
use std::{fmt, time::Duration};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid as NixPid,
};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, error, info, warn};

use crate::{
    command::{CommandLine, CommandRunner},
    constants::DEFAULT_COMMAND_TIMEOUT,
    error::{CommandError, Interrupted, ProcessError},
    wait::Wait,
};

/// Whether the application was observed in the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Stopped,
}

/// How a stop request concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing matched; no signal was sent.
    AlreadyStopped,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Exited after SIGKILL.
    Forced,
    /// SIGKILL was sent but a matching process was still observed afterwards.
    Uncertain,
}

impl fmt::Display for StopOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StopOutcome::AlreadyStopped => "already stopped",
            StopOutcome::Graceful => "stopped gracefully",
            StopOutcome::Forced => "force killed",
            StopOutcome::Uncertain => "kill unconfirmed",
        };
        f.write_str(label)
    }
}

/// Capability the orchestrator uses to control the application process.
pub trait ProcessControl {
    /// Whether any process matching `pattern` is alive. Never fails; a failed
    /// query is reported as not running.
    fn is_running(&self, pattern: &str) -> bool;

    /// SIGTERM, wait `grace_period`, then SIGKILL and wait `force_delay` if needed.
    fn stop(
        &self,
        pattern: &str,
        grace_period: Duration,
        force_delay: Duration,
        wait: &dyn Wait,
    ) -> Result<StopOutcome, ProcessError>;

    /// Runs the start command and waits `settle_delay` once it returns.
    fn start(
        &self,
        command: &CommandLine,
        settle_delay: Duration,
        wait: &dyn Wait,
    ) -> Result<(), ProcessError>;

    /// Convenience wrapper over [`ProcessControl::is_running`].
    fn state(&self, pattern: &str) -> ProcessState {
        if self.is_running(pattern) {
            ProcessState::Running
        } else {
            ProcessState::Stopped
        }
    }
}

/// Process controller backed by the OS process table and POSIX signals.
pub struct ProcessController<R> {
    runner: R,
    command_timeout: Duration,
}

impl<R: CommandRunner> ProcessController<R> {
    /// Creates a controller that launches start commands through `runner`.
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Overrides the timeout applied to start commands.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// PIDs of live processes whose command line contains `pattern`, excluding
    /// this process and its parent so the deploy tool never matches itself.
    pub fn matching_pids(pattern: &str) -> Vec<u32> {
        if pattern.trim().is_empty() {
            warn!("Empty process pattern; treating application as not running");
            return Vec::new();
        }

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let own_pid = Pid::from_u32(std::process::id());
        let parent_pid = system.process(own_pid).and_then(|process| process.parent());

        let mut pids: Vec<u32> = system
            .processes()
            .iter()
            .filter(|(pid, _)| **pid != own_pid && Some(**pid) != parent_pid)
            .filter(|(_, process)| {
                process.thread_kind().is_none()
                    && !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
            })
            .filter(|(_, process)| {
                let cmdline = if process.cmd().is_empty() {
                    process.name().to_string_lossy().into_owned()
                } else {
                    process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy())
                        .collect::<Vec<_>>()
                        .join(" ")
                };
                cmdline.contains(pattern)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect();

        pids.sort_unstable();
        pids
    }

    /// Sends `sig` to each PID. Processes that already exited are ignored.
    fn signal_all(pids: &[u32], sig: Signal, pattern: &str) -> Result<(), ProcessError> {
        for &pid in pids {
            match signal::kill(NixPid::from_raw(pid as i32), sig) {
                Ok(()) => debug!("Sent {sig} to PID {pid} ('{pattern}')"),
                Err(Errno::ESRCH) => {
                    debug!("PID {pid} exited before {sig} could be delivered")
                }
                Err(source) => {
                    error!("Failed to send {sig} to PID {pid} ('{pattern}'): {source}");
                    return Err(ProcessError::StopFailed {
                        target: pattern.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

impl<R: CommandRunner> ProcessControl for ProcessController<R> {
    fn is_running(&self, pattern: &str) -> bool {
        let pids = Self::matching_pids(pattern);
        if pids.is_empty() {
            info!("'{pattern}' is not running");
            false
        } else {
            info!("'{pattern}' is running (PIDs {:?})", pids);
            true
        }
    }

    fn stop(
        &self,
        pattern: &str,
        grace_period: Duration,
        force_delay: Duration,
        wait: &dyn Wait,
    ) -> Result<StopOutcome, ProcessError> {
        let pids = Self::matching_pids(pattern);
        if pids.is_empty() {
            info!("No running process matches '{pattern}'; nothing to stop");
            return Ok(StopOutcome::AlreadyStopped);
        }

        info!("Stopping '{pattern}' (PIDs {:?}) with SIGTERM", pids);
        Self::signal_all(&pids, Signal::SIGTERM, pattern)?;
        wait.wait(grace_period)?;

        let remaining = Self::matching_pids(pattern);
        if remaining.is_empty() {
            info!("'{pattern}' stopped gracefully");
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            "'{pattern}' did not exit within {:?} of SIGTERM; sending SIGKILL to {:?}",
            grace_period, remaining
        );
        Self::signal_all(&remaining, Signal::SIGKILL, pattern)?;
        wait.wait(force_delay)?;

        let survivors = Self::matching_pids(pattern);
        if survivors.is_empty() {
            info!("'{pattern}' force killed");
            Ok(StopOutcome::Forced)
        } else {
            warn!("'{pattern}' still observed after SIGKILL (PIDs {:?})", survivors);
            Ok(StopOutcome::Uncertain)
        }
    }

    fn start(
        &self,
        command: &CommandLine,
        settle_delay: Duration,
        wait: &dyn Wait,
    ) -> Result<(), ProcessError> {
        info!("Starting application with `{command}`");
        let output = self
            .runner
            .run(command, self.command_timeout, wait)
            .map_err(|err| match err {
                CommandError::Interrupted { .. } => ProcessError::Interrupted(Interrupted),
                other => ProcessError::StartFailed(other.to_string()),
            })?;

        if !output.success() {
            let detail = output.stderr.trim();
            let message = match output.exit_code {
                Some(code) if detail.is_empty() => format!("exit code {code}"),
                Some(code) => format!("exit code {code}: {detail}"),
                None => "terminated by signal".to_string(),
            };
            return Err(ProcessError::StartFailed(message));
        }

        debug!("Start command returned; settling for {:?}", settle_delay);
        wait.wait(settle_delay)?;
        info!("Application started");
        Ok(())
    }
}
