//! Deployment status events.
//!
//! Delivery to chat or mail is left to whatever consumes the event; redeploy logs
//! it and can write it as JSON for a later pipeline step to forward.
use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{error, info, warn};

use crate::constants::NOTIFICATION_TIME_FORMAT;

/// Terminal status carried by a [`DeploymentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failure,
}

/// Payload emitted exactly once at the end of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub status: EventStatus,
    pub app_name: String,
    pub version: String,
    pub timestamp: DateTime<Local>,
    pub message: String,
    /// Whether the previous version was restored after a failure.
    pub rolled_back: bool,
}

impl DeploymentEvent {
    /// Human-readable banner mirroring what operators see on the console.
    pub fn banner(&self) -> String {
        let rule = "=".repeat(40);
        format!(
            "{rule}\nDEPLOYMENT NOTIFICATION\n{rule}\nStatus: {}\nApplication: {}\nVersion: {}\nTime: {}\nMessage: {}\n{rule}",
            self.status.as_ref().to_uppercase(),
            self.app_name,
            self.version,
            self.timestamp.format(NOTIFICATION_TIME_FORMAT),
            self.message,
        )
    }
}

/// Sink for the end-of-run event.
pub trait Notifier {
    /// Publishes `event`. Failures are the notifier's to log; they never change the
    /// deployment outcome.
    fn notify(&self, event: &DeploymentEvent);
}

/// Logs the event and optionally persists it as JSON.
#[derive(Debug, Clone, Default)]
pub struct EventNotifier {
    event_file: Option<PathBuf>,
    targets: Vec<String>,
}

impl EventNotifier {
    /// A notifier that only logs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also writes each event as pretty JSON to `path`.
    pub fn with_event_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_file = Some(path.into());
        self
    }

    /// Records the configured delivery targets (webhook URL, mail address) for the log.
    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    fn write_event_file(path: &Path, event: &DeploymentEvent) {
        let payload = match serde_json::to_string_pretty(event) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to serialise deployment event: {err}");
                return;
            }
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!("Failed to create {}: {err}", parent.display());
        }

        match fs::write(path, payload) {
            Ok(()) => info!("Deployment event written to {}", path.display()),
            Err(err) => error!(
                "Failed to write deployment event to {}: {err}",
                path.display()
            ),
        }
    }
}

impl Notifier for EventNotifier {
    fn notify(&self, event: &DeploymentEvent) {
        info!("Sending {} notification...", event.status);
        println!("{}", event.banner());

        if !self.targets.is_empty() {
            info!("Notification targets: {}", self.targets.join(", "));
        }

        if let Some(path) = &self.event_file {
            Self::write_event_file(path, event);
        }
    }
}
