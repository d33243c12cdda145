//! Command-line interface for redeploy.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::{BackupFailurePolicy, ConfigOverrides, TimingsConfig};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for redeploy.
#[derive(Parser)]
#[command(name = "redeploy", version, author)]
#[command(about = "Deploy an application build with backup, health checks, and rollback", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Settings shared by every subcommand. Each flag falls back to a
/// `REDEPLOY_*` environment variable, then to the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Path to the configuration file (defaults to `redeploy.yaml` when present).
    #[arg(short, long, env = "REDEPLOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Application name; also names backup directories.
    #[arg(long, env = "REDEPLOY_APP_NAME")]
    pub app_name: Option<String>,

    /// Version label of the build being deployed.
    #[arg(long = "version-label", env = "REDEPLOY_APP_VERSION")]
    pub app_version: Option<String>,

    /// Directory holding the new build.
    #[arg(long, env = "REDEPLOY_SOURCE_DIR")]
    pub source_dir: Option<PathBuf>,

    /// Live deployment directory.
    #[arg(long, env = "REDEPLOY_DEPLOY_DIR")]
    pub deploy_dir: Option<PathBuf>,

    /// Directory that receives timestamped backups.
    #[arg(long, env = "REDEPLOY_BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// URL polled after start; any 2xx counts as healthy.
    #[arg(long = "health-url", env = "REDEPLOY_HEALTH_CHECK_URL")]
    pub health_check_url: Option<String>,

    /// Pattern matched against process command lines (defaults to the app name).
    #[arg(long, env = "REDEPLOY_PROCESS_PATTERN")]
    pub process_pattern: Option<String>,

    /// Shell command used to launch the application from the deploy directory.
    #[arg(long, env = "REDEPLOY_START_COMMAND")]
    pub start_command: Option<String>,

    /// Overall health check budget reported in the logs (e.g. `60s`).
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_HEALTH_CHECK_TIMEOUT")]
    pub health_check_timeout: Option<String>,

    /// Glob of top-level files marked executable after install. Repeatable or
    /// comma separated.
    #[arg(
        long = "entrypoint",
        value_name = "GLOB",
        env = "REDEPLOY_ENTRYPOINTS",
        value_delimiter = ','
    )]
    pub entrypoints: Option<Vec<String>>,

    /// Chat webhook named in the end-of-run notification.
    #[arg(long, env = "REDEPLOY_NOTIFY_WEBHOOK")]
    pub webhook: Option<String>,

    /// Mail address named in the end-of-run notification.
    #[arg(long, env = "REDEPLOY_NOTIFY_EMAIL")]
    pub email: Option<String>,

    #[command(flatten)]
    pub timings: TimingArgs,
}

/// Durations accept `<n>[ms|s|m|h]`; a bare number is seconds.
#[derive(Args, Debug, Clone, Default)]
#[command(next_help_heading = "Timings")]
pub struct TimingArgs {
    /// How long to wait after SIGTERM before escalating.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_GRACE_PERIOD")]
    pub grace_period: Option<String>,

    /// How long to wait after SIGKILL before re-checking.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_FORCE_DELAY")]
    pub force_delay: Option<String>,

    /// Pause after the start command returns.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_SETTLE_DELAY")]
    pub settle_delay: Option<String>,

    /// Pause between health check attempts.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_PROBE_INTERVAL")]
    pub probe_interval: Option<String>,

    /// Maximum number of health check attempts.
    #[arg(long, value_name = "N", env = "REDEPLOY_PROBE_ATTEMPTS")]
    pub probe_attempts: Option<u32>,

    /// Timeout of a single health check request.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_PROBE_TIMEOUT")]
    pub probe_timeout: Option<String>,

    /// Hard limit on the start command.
    #[arg(long, value_name = "DURATION", env = "REDEPLOY_COMMAND_TIMEOUT")]
    pub command_timeout: Option<String>,
}

impl From<&TimingArgs> for TimingsConfig {
    fn from(args: &TimingArgs) -> Self {
        TimingsConfig {
            grace_period: args.grace_period.clone(),
            force_delay: args.force_delay.clone(),
            settle_delay: args.settle_delay.clone(),
            probe_interval: args.probe_interval.clone(),
            probe_attempts: args.probe_attempts,
            probe_timeout: args.probe_timeout.clone(),
            command_timeout: args.command_timeout.clone(),
        }
    }
}

impl TargetArgs {
    /// Converts the flags into config overrides.
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            app_name: self.app_name.clone(),
            app_version: self.app_version.clone(),
            source_dir: self.source_dir.clone(),
            deploy_dir: self.deploy_dir.clone(),
            backup_dir: self.backup_dir.clone(),
            health_check_url: self.health_check_url.clone(),
            process_pattern: self.process_pattern.clone(),
            start_command: self.start_command.clone(),
            health_check_timeout: self.health_check_timeout.clone(),
            entrypoints: self.entrypoints.clone(),
            webhook: self.webhook.clone(),
            email: self.email.clone(),
            timings: TimingsConfig::from(&self.timings),
            ..Default::default()
        }
    }
}

/// Available commands for redeploy.
#[derive(Subcommand)]
pub enum Commands {
    /// Deploy the build in the source directory, rolling back on failure.
    Deploy {
        #[command(flatten)]
        target: TargetArgs,

        /// Behaviour when the pre-deploy backup fails: `continue` or `abort`.
        #[arg(long, value_name = "POLICY", env = "REDEPLOY_ON_BACKUP_FAILURE")]
        on_backup_failure: Option<BackupFailurePolicy>,

        /// Abort when the old process cannot be confirmed stopped after SIGKILL.
        #[arg(long)]
        abort_on_uncertain_stop: bool,

        /// Write the end-of-run event as JSON to this file.
        #[arg(long, value_name = "PATH", env = "REDEPLOY_EVENT_FILE")]
        event_file: Option<PathBuf>,

        /// Skip the lock that serialises runs against the same deploy directory.
        #[arg(long)]
        no_lock: bool,
    },

    /// Report whether the application is running and healthy.
    Status {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// List backups of the application, newest first.
    Backups {
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
