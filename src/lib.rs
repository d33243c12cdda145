//! redeploy replaces a running application with a new build: it backs up the
//! live deployment, stops the old process, copies the new artifact into place,
//! starts it, and polls a health endpoint. When the new version fails to come up
//! healthy, the previous deployment is restored and restarted.

/// Artifact backup, install, and restore.
pub mod artifact;

/// CLI interface.
pub mod cli;

/// Bounded external command execution.
pub mod command;

/// Configuration management.
pub mod config;

/// Shared defaults.
pub mod constants;

/// Error handling.
pub mod error;

/// Readiness probing.
pub mod health;

/// Per-location deploy lock.
pub mod lock;

/// End-of-run notifications.
pub mod notify;

/// Deployment state machine.
pub mod orchestrator;

/// Locating, stopping, and starting the application process.
pub mod process;

/// Cancellation-aware waiting.
pub mod wait;
