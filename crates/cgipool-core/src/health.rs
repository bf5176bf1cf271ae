//! Health check specifications.
//!
//! A `HealthCheckSpec` is immutable and embedded by value wherever a probe is
//! needed. The on-disk form keeps the historical field names: a `port` check
//! uses `target`, an `http` check may use `url`, a `command` check may use
//! `command`.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;

const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

/// The probe strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// TCP connect to `localhost:<target>`.
    Port,
    /// `GET <target>`, healthy on status 200.
    Http,
    /// `sh -c <target>`, healthy on exit code 0.
    Command,
}

impl fmt::Display for HealthCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port => f.write_str("port"),
            Self::Http => f.write_str("http"),
            Self::Command => f.write_str("command"),
        }
    }
}

/// A single liveness/readiness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHealthCheck", into = "RawHealthCheck")]
pub struct HealthCheckSpec {
    pub kind: HealthCheckKind,
    pub target: String,
    pub timeout: Duration,
}

impl HealthCheckSpec {
    pub fn port(port: u16, timeout: Duration) -> Self {
        Self {
            kind: HealthCheckKind::Port,
            target: port.to_string(),
            timeout,
        }
    }

    pub fn http(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: HealthCheckKind::Http,
            target: url.into(),
            timeout,
        }
    }

    pub fn command(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            kind: HealthCheckKind::Command,
            target: command.into(),
            timeout,
        }
    }

    /// The port of a `Port` check, if the target parses.
    pub fn target_port(&self) -> Option<u16> {
        match self.kind {
            HealthCheckKind::Port => self.target.trim().parse().ok(),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.target.trim().is_empty() {
            return Err(format!("{} health check has an empty target", self.kind));
        }
        if self.timeout.is_zero() {
            return Err(format!("{} health check has a zero timeout", self.kind));
        }
        if self.kind == HealthCheckKind::Port && self.target_port().is_none() {
            return Err(format!("port health check target is not a port: {}", self.target));
        }
        Ok(())
    }
}

/// Wire form of a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawHealthCheck {
    #[serde(rename = "type")]
    kind: HealthCheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: f64,
}

fn default_timeout() -> f64 {
    DEFAULT_TIMEOUT_SECS
}

impl TryFrom<RawHealthCheck> for HealthCheckSpec {
    type Error = String;

    fn try_from(raw: RawHealthCheck) -> Result<Self, Self::Error> {
        let target = match raw.kind {
            HealthCheckKind::Port => raw.target,
            HealthCheckKind::Http => raw.url.or(raw.target),
            HealthCheckKind::Command => raw.command.or(raw.target),
        }
        .ok_or_else(|| format!("{} health check is missing its target", raw.kind))?;

        let spec = HealthCheckSpec {
            kind: raw.kind,
            target,
            timeout: duration::from_secs(raw.timeout)?,
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl From<HealthCheckSpec> for RawHealthCheck {
    fn from(spec: HealthCheckSpec) -> Self {
        RawHealthCheck {
            kind: spec.kind,
            target: Some(spec.target),
            url: None,
            command: None,
            timeout: spec.timeout.as_secs_f64(),
        }
    }
}
