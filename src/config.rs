//! Configuration management for redeploy.
//!
//! Settings are layered: built-in defaults, then the YAML file (with `${VAR}`
//! expansion), then CLI flags / `REDEPLOY_*` environment variables.
use std::{
    env, fs,
    path::{self, Component, Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use strum_macros::{AsRefStr, EnumString};

use crate::{
    command::CommandLine,
    constants::{
        DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONFIG_FILE, DEFAULT_ENTRYPOINTS,
        DEFAULT_FORCE_DELAY, DEFAULT_GRACE_PERIOD, DEFAULT_HEALTH_CHECK_TIMEOUT,
        DEFAULT_PROBE_ATTEMPTS, DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT,
        DEFAULT_SETTLE_DELAY, FALLBACK_BINARY_NAME, START_SCRIPT_NAME,
    },
    error::ConfigError,
    health::ProbePolicy,
};

/// What to do when the pre-deploy backup cannot be taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupFailurePolicy {
    /// Log and deploy without a rollback safety net.
    #[default]
    Continue,
    /// Abort before touching the running application.
    Abort,
}

/// Structure of the YAML configuration file. Every field is optional so the
/// file can be partial and completed from the CLI.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub deploy_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub health_check_url: Option<String>,
    /// Informational overall budget (e.g. `60s`); probing uses `timings`.
    pub health_check_timeout: Option<String>,
    /// Substring matched against process command lines. Defaults to `app_name`.
    pub process_pattern: Option<String>,
    pub start_command: Option<String>,
    pub entrypoints: Option<Vec<String>>,
    pub on_backup_failure: Option<BackupFailurePolicy>,
    pub abort_on_uncertain_stop: Option<bool>,
    pub notify: Option<NotifyConfig>,
    pub timings: Option<TimingsConfig>,
}

/// Notification settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Chat webhook the event is meant for. Delivery is external.
    pub webhook: Option<String>,
    /// Mail address the event is meant for. Delivery is external.
    pub email: Option<String>,
    /// Where to write the event as JSON.
    pub event_file: Option<PathBuf>,
}

impl NotifyConfig {
    /// Configured delivery targets, for logging.
    pub fn targets(&self) -> Vec<String> {
        self.webhook.iter().chain(self.email.iter()).cloned().collect()
    }
}

/// Raw timing overrides as written in the file or on the command line
/// (`<n>[ms|s|m|h]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimingsConfig {
    pub grace_period: Option<String>,
    pub force_delay: Option<String>,
    pub settle_delay: Option<String>,
    pub probe_interval: Option<String>,
    pub probe_attempts: Option<u32>,
    pub probe_timeout: Option<String>,
    pub command_timeout: Option<String>,
}

/// Resolved timings used by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub grace_period: Duration,
    pub force_delay: Duration,
    pub settle_delay: Duration,
    pub probe_interval: Duration,
    pub probe_attempts: u32,
    pub probe_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            force_delay: DEFAULT_FORCE_DELAY,
            settle_delay: DEFAULT_SETTLE_DELAY,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl Timings {
    /// Probe parameters derived from these timings.
    pub fn probe_policy(&self) -> ProbePolicy {
        ProbePolicy {
            interval: self.probe_interval,
            max_attempts: self.probe_attempts,
            attempt_timeout: self.probe_timeout,
        }
    }

    fn apply(&mut self, raw: &TimingsConfig) -> Result<(), ConfigError> {
        let fields: [(&'static str, &Option<String>, &mut Duration); 6] = [
            ("timings.grace_period", &raw.grace_period, &mut self.grace_period),
            ("timings.force_delay", &raw.force_delay, &mut self.force_delay),
            ("timings.settle_delay", &raw.settle_delay, &mut self.settle_delay),
            ("timings.probe_interval", &raw.probe_interval, &mut self.probe_interval),
            ("timings.probe_timeout", &raw.probe_timeout, &mut self.probe_timeout),
            (
                "timings.command_timeout",
                &raw.command_timeout,
                &mut self.command_timeout,
            ),
        ];
        for (field, value, slot) in fields {
            if let Some(value) = value {
                *slot = parse_duration_field(field, value)?;
            }
        }
        if let Some(attempts) = raw.probe_attempts {
            self.probe_attempts = attempts;
        }
        Ok(())
    }
}

/// Identity of one deployment run. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub app_name: String,
    pub version: String,
    pub source_dir: PathBuf,
    pub deploy_dir: PathBuf,
    pub backup_dir: PathBuf,
}

/// Values supplied on the command line or through `REDEPLOY_*` variables.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub app_name: Option<String>,
    pub app_version: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub deploy_dir: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
    pub health_check_url: Option<String>,
    pub process_pattern: Option<String>,
    pub start_command: Option<String>,
    pub on_backup_failure: Option<BackupFailurePolicy>,
    pub abort_on_uncertain_stop: bool,
    pub event_file: Option<PathBuf>,
    pub health_check_timeout: Option<String>,
    pub entrypoints: Option<Vec<String>>,
    pub webhook: Option<String>,
    pub email: Option<String>,
    pub timings: TimingsConfig,
}

/// Fully resolved configuration handed to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployConfig {
    pub request: DeploymentRequest,
    pub health_check_url: String,
    pub health_check_timeout: Duration,
    pub process_pattern: String,
    pub start_command: Option<String>,
    pub entrypoints: Vec<String>,
    pub on_backup_failure: BackupFailurePolicy,
    pub abort_on_uncertain_stop: bool,
    pub notify: NotifyConfig,
    pub timings: Timings,
}

impl DeployConfig {
    /// Merges `file` and `overrides` (overrides win) and validates the result.
    pub fn resolve(
        file: FileConfig,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let app_name = overrides
            .app_name
            .or(file.app_name)
            .filter(|name| !name.trim().is_empty())
            .ok_or(ConfigError::MissingField("app_name"))?;
        let version = overrides
            .app_version
            .or(file.app_version)
            .unwrap_or_else(|| "unversioned".to_string());
        let source_dir = overrides
            .source_dir
            .or(file.source_dir)
            .ok_or(ConfigError::MissingField("source_dir"))
            .and_then(|dir| absolute_dir("source_dir", &dir))?;
        let deploy_dir = overrides
            .deploy_dir
            .or(file.deploy_dir)
            .ok_or(ConfigError::MissingField("deploy_dir"))
            .and_then(|dir| absolute_dir("deploy_dir", &dir))?;
        let backup_dir = overrides
            .backup_dir
            .or(file.backup_dir)
            .ok_or(ConfigError::MissingField("backup_dir"))
            .and_then(|dir| absolute_dir("backup_dir", &dir))?;

        if deploy_dir.file_name().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "deploy_dir",
                message: format!("{} has no final path component", deploy_dir.display()),
            });
        }
        if deploy_dir == source_dir {
            return Err(ConfigError::InvalidValue {
                field: "deploy_dir",
                message: "must differ from source_dir".into(),
            });
        }
        if deploy_dir.starts_with(&source_dir) {
            return Err(ConfigError::InvalidValue {
                field: "deploy_dir",
                message: "must not live inside source_dir".into(),
            });
        }
        if backup_dir.starts_with(&deploy_dir) {
            return Err(ConfigError::InvalidValue {
                field: "backup_dir",
                message: "must not live inside deploy_dir".into(),
            });
        }

        let health_check_url = overrides
            .health_check_url
            .or(file.health_check_url)
            .ok_or(ConfigError::MissingField("health_check_url"))?;
        Url::parse(&health_check_url).map_err(|err| ConfigError::InvalidValue {
            field: "health_check_url",
            message: err.to_string(),
        })?;

        let health_check_timeout = match overrides
            .health_check_timeout
            .as_ref()
            .or(file.health_check_timeout.as_ref())
        {
            Some(raw) => parse_duration_field("health_check_timeout", raw)?,
            None => DEFAULT_HEALTH_CHECK_TIMEOUT,
        };

        let mut timings = Timings::default();
        if let Some(raw) = &file.timings {
            timings.apply(raw)?;
        }
        timings.apply(&overrides.timings)?;
        if timings.command_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timings.command_timeout",
                message: "must be positive".into(),
            });
        }
        if timings.probe_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "timings.probe_attempts",
                message: "must be at least 1".into(),
            });
        }

        let process_pattern = overrides
            .process_pattern
            .or(file.process_pattern)
            .unwrap_or_else(|| app_name.clone());

        let mut notify = file.notify.unwrap_or_default();
        if overrides.event_file.is_some() {
            notify.event_file = overrides.event_file;
        }
        if overrides.webhook.is_some() {
            notify.webhook = overrides.webhook;
        }
        if overrides.email.is_some() {
            notify.email = overrides.email;
        }

        Ok(Self {
            request: DeploymentRequest {
                app_name,
                version,
                source_dir,
                deploy_dir,
                backup_dir,
            },
            health_check_url,
            health_check_timeout,
            process_pattern,
            start_command: overrides.start_command.or(file.start_command),
            entrypoints: overrides.entrypoints.or(file.entrypoints).unwrap_or_else(|| {
                DEFAULT_ENTRYPOINTS.iter().map(|s| s.to_string()).collect()
            }),
            on_backup_failure: overrides
                .on_backup_failure
                .or(file.on_backup_failure)
                .unwrap_or_default(),
            abort_on_uncertain_stop: overrides.abort_on_uncertain_stop
                || file.abort_on_uncertain_stop.unwrap_or(false),
            notify,
            timings,
        })
    }

    /// Command that launches the deployed application.
    ///
    /// Evaluated at start time, since whether `start.sh` exists depends on what
    /// was just installed or restored.
    pub fn start_command(&self) -> CommandLine {
        let deploy_dir = &self.request.deploy_dir;
        if let Some(command) = &self.start_command {
            return CommandLine::shell(format!(
                "cd {} && {command}",
                shell_quote(&deploy_dir.to_string_lossy())
            ));
        }

        let script = deploy_dir.join(START_SCRIPT_NAME);
        if script.is_file() {
            return CommandLine::args([script.to_string_lossy().into_owned()]);
        }

        CommandLine::shell(format!(
            "cd {} && nohup ./{FALLBACK_BINARY_NAME} >/dev/null 2>&1 &",
            shell_quote(&deploy_dir.to_string_lossy())
        ))
    }
}

/// Expands `$VAR` and `${VAR}` references from the environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").map_err(|err| {
        ConfigError::InvalidValue {
            field: "config",
            message: err.to_string(),
        }
    })?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    match missing {
        Some(var) => Err(ConfigError::MissingEnvVar(var)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// With no explicit path, `redeploy.yaml` in the working directory is used if it
/// exists; otherwise an empty configuration is returned so the CLI can supply
/// everything.
pub fn load_config(config_path: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let config_path = match config_path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Path::new(DEFAULT_CONFIG_FILE),
        None => return Ok(FileConfig::default()),
    };

    let content = fs::read_to_string(config_path).map_err(|e| {
        ConfigError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let config: FileConfig =
        serde_yaml::from_str(&expanded).map_err(ConfigError::ConfigParseError)?;
    Ok(config)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(stripped) = value.strip_suffix("ms") {
        return stripped.trim().parse().ok().map(Duration::from_millis);
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().ok()?;
    Some(Duration::from_secs(amount.saturating_mul(multiplier)))
}

fn parse_duration_field(field: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    parse_duration(raw).ok_or_else(|| ConfigError::InvalidValue {
        field,
        message: format!("invalid duration '{raw}'"),
    })
}

/// Makes `dir` absolute against the working directory and folds away `.` and
/// `..` so differently spelled paths compare equal.
fn absolute_dir(field: &'static str, dir: &Path) -> Result<PathBuf, ConfigError> {
    let absolute = path::absolute(dir).map_err(|err| ConfigError::InvalidValue {
        field,
        message: format!("{}: {err}", dir.display()),
    })?;

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
