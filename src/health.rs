//! Readiness probing of the freshly started application.
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, error, info, warn};

use crate::{error::Interrupted, wait::Wait};

/// Result of a probing session. Never cached; each session probes afresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A single bounded readiness check against an endpoint.
pub trait HealthCheck {
    /// Performs one check. `Ok(())` means the endpoint reported ready.
    fn check(&self, endpoint: &str, timeout: Duration) -> Result<(), String>;
}

/// HTTP `GET` check; any 2xx response counts as healthy.
#[derive(Debug, Clone, Default)]
pub struct HttpCheck;

impl HealthCheck for HttpCheck {
    fn check(&self, endpoint: &str, timeout: Duration) -> Result<(), String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| err.to_string())?;

        let response = client.get(endpoint).send().map_err(|err| err.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("endpoint returned {status}"))
        }
    }
}

/// Parameters for a probing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    /// Sleep between failed attempts.
    pub interval: Duration,
    /// Attempts before giving up. Zero is treated as one.
    pub max_attempts: u32,
    /// Timeout for each individual check.
    pub attempt_timeout: Duration,
}

/// Polls a [`HealthCheck`] until it succeeds or attempts run out.
#[derive(Debug, Clone, Default)]
pub struct HealthProber<C> {
    check: C,
}

impl<C: HealthCheck> HealthProber<C> {
    /// Wraps `check`.
    pub fn new(check: C) -> Self {
        Self { check }
    }

    /// Probes `endpoint` until healthy or `policy.max_attempts` is exhausted.
    ///
    /// Check failures are logged and retried; only cancellation during the
    /// inter-attempt sleep ends the session early.
    pub fn probe(
        &self,
        endpoint: &str,
        policy: ProbePolicy,
        wait: &dyn Wait,
    ) -> Result<HealthStatus, Interrupted> {
        let max_attempts = policy.max_attempts.max(1);
        info!("Performing health check against {endpoint}");

        for attempt in 1..=max_attempts {
            if wait.interrupted() {
                return Err(Interrupted);
            }
            debug!("Health check attempt {attempt}/{max_attempts}");
            match self.check.check(endpoint, policy.attempt_timeout) {
                Ok(()) => {
                    info!("Health check passed on attempt {attempt}");
                    return Ok(HealthStatus::Healthy);
                }
                Err(reason) => {
                    warn!("Health check attempt {attempt}/{max_attempts} failed: {reason}");
                }
            }

            if attempt < max_attempts {
                wait.wait(policy.interval)?;
            }
        }

        error!("Health check failed; application is not responding");
        Ok(HealthStatus::Unhealthy)
    }
}

/// Probes reachable through a trait object, so the orchestrator can hold any prober.
pub trait Probe {
    /// See [`HealthProber::probe`].
    fn probe(
        &self,
        endpoint: &str,
        policy: ProbePolicy,
        wait: &dyn Wait,
    ) -> Result<HealthStatus, Interrupted>;
}

impl<C: HealthCheck> Probe for HealthProber<C> {
    fn probe(
        &self,
        endpoint: &str,
        policy: ProbePolicy,
        wait: &dyn Wait,
    ) -> Result<HealthStatus, Interrupted> {
        HealthProber::probe(self, endpoint, policy, wait)
    }
}
