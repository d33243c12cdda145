//! Error handling for redeploy.
use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Errors raised while executing an external command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be spawned (missing binary, permissions, ...).
    #[error("Failed to launch `{command}`: {source}")]
    Launch {
        /// Rendered command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The command did not finish before its deadline and was killed.
    #[error("Command `{command}` timed out after {timeout:?}")]
    TimedOut {
        /// Rendered command line.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The run was interrupted while the command was executing; it was killed.
    #[error("Command `{command}` interrupted")]
    Interrupted {
        /// Rendered command line.
        command: String,
    },

    /// A zero timeout was requested.
    #[error("Command timeout must be positive")]
    InvalidTimeout,
}

/// Errors raised by the process controller.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A termination signal could not be delivered.
    #[error("Failed to stop '{target}': {source}")]
    StopFailed {
        /// The process pattern being stopped.
        target: String,
        /// The underlying error that occurred.
        #[source]
        source: nix::errno::Errno,
    },

    /// The start command failed, exited non-zero, or timed out.
    #[error("Failed to start application: {0}")]
    StartFailed(String),

    /// A blocking wait was cut short by a cancellation request.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Errors raised by the artifact manager.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The build artifact directory does not exist.
    #[error("Source directory not found: {}", .0.display())]
    SourceMissing(PathBuf),

    /// Installing the new artifact failed partway.
    #[error("Failed to write deployment at {}: {source}", path.display())]
    DeployWriteError {
        /// The path being written when the failure occurred.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Rollback was requested but no usable snapshot exists.
    #[error("No backup available for rollback")]
    BackupUnavailable,

    /// Copying the live deployment into the backup root failed.
    #[error("Failed to back up to {}: {source}", path.display())]
    BackupFailed {
        /// Intended backup location.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Swapping the snapshot back into place failed.
    #[error("Failed to restore {}: {source}", path.display())]
    RestoreFailed {
        /// The deployment location being restored.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Marker error for a wait that observed a cancellation request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Deployment interrupted")]
pub struct Interrupted;

/// Failures the orchestrator can terminate on.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Artifact backup, install, or restore failed.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Stopping or starting the application failed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// The health endpoint never reported success.
    #[error("Health check failed after {attempts} attempts")]
    HealthCheckExhausted {
        /// Number of probe attempts made.
        attempts: u32,
    },

    /// The stop signal was sent but the process was still observed afterwards.
    #[error("Application '{0}' may still be running after SIGKILL")]
    StopUncertain(String),

    /// Another orchestrator holds the lock for this deployment location.
    #[error("Deployment location {} is locked by another run", .0.display())]
    DeployLocked(PathBuf),

    /// Cancellation was requested while the run was in progress.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// Anything the state machine did not anticipate (panics included).
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl DeployError {
    /// Whether the failure came from a cancellation request.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            DeployError::Interrupted(_)
                | DeployError::Process(ProcessError::Interrupted(_))
        )
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A `${VAR}` reference points at an unset environment variable.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A required field was not provided by the file, environment, or CLI.
    #[error("Missing required setting '{0}'")]
    MissingField(&'static str),

    /// A field is present but unusable.
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },
}
