//! Constants and default values for redeploy.
//!
//! Every timing the orchestrator uses has a default here; `config::Timings`
//! starts from these and lets the configuration file or CLI override them.

use std::time::Duration;

// ============================================================================
// Configuration Files
// ============================================================================

/// Configuration file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "redeploy.yaml";

/// Suffix appended to the deployment location to form its lock file path.
pub const LOCK_SUFFIX: &str = ".lock";

// ============================================================================
// Shell Execution Constants
// ============================================================================

/// Default shell used for executing string commands.
pub const DEFAULT_SHELL: &str = "sh";

/// Shell argument flag for executing command strings.
pub const SHELL_COMMAND_FLAG: &str = "-c";

/// Upper bound for any single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Poll interval used while waiting on a child process.
pub const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Process Management Timing
// ============================================================================

/// Time between SIGTERM and the follow-up liveness check.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Time between SIGKILL and the final liveness check.
pub const DEFAULT_FORCE_DELAY: Duration = Duration::from_secs(2);

/// Pause after the start command returns, before health checking.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Granularity at which interruptible waits observe cancellation.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Health Probing
// ============================================================================

/// Sleep between failed probe attempts.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Number of probe attempts before declaring the application unhealthy.
pub const DEFAULT_PROBE_ATTEMPTS: u32 = 12;

/// Timeout applied to each individual probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Informational overall health check budget. Only logged; probing is bounded by
/// the probe timings.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Artifacts
// ============================================================================

/// `strftime` format for backup directory suffixes. Sorts lexically by time.
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Entry-point patterns marked executable after install.
pub const DEFAULT_ENTRYPOINTS: &[&str] = &["*.sh"];

/// Script preferred as the start command when present in the deployment.
pub const START_SCRIPT_NAME: &str = "start.sh";

/// Binary launched in the background when no start script exists.
pub const FALLBACK_BINARY_NAME: &str = "app";

// ============================================================================
// Notifications
// ============================================================================

/// Timestamp format used in the human-readable notification banner.
pub const NOTIFICATION_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
