//! Tracked processes and their status view.

use std::fmt;
use std::time::{Duration, Instant};

use cgipool_core::{ProcessConfig, RestartPolicy};

use crate::handle::ProcessHandle;

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    /// Alive, but its last health check failed and its policy keeps it.
    Unhealthy,
    Restarting,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
        };
        f.write_str(s)
    }
}

/// A process the supervisor started and still owns.
#[derive(Debug)]
pub(crate) struct ManagedProcess {
    pub(crate) name: String,
    pub(crate) config: ProcessConfig,
    pub(crate) handle: ProcessHandle,
    pub(crate) state: ProcessState,
    pub(crate) started_at: Instant,
    pub(crate) restart_count: u32,
    /// Result of the last periodic health check, if one ran.
    pub(crate) healthy: Option<bool>,
}

impl ManagedProcess {
    pub(crate) fn status(&self) -> ProcessStatus {
        ProcessStatus {
            name: self.name.clone(),
            state: self.state,
            pid: self.handle.pid(),
            started_at: Some(self.started_at),
            uptime: Some(self.started_at.elapsed()),
            restart_count: self.restart_count,
            restart_policy: self.config.restart_policy,
            healthy: self.healthy,
        }
    }
}

/// Read-only view of one configured process.
#[derive(Debug, Clone)]
pub struct ProcessStatus {
    pub name: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub uptime: Option<Duration>,
    pub restart_count: u32,
    pub restart_policy: RestartPolicy,
    pub healthy: Option<bool>,
}

impl ProcessStatus {
    pub(crate) fn stopped(name: &str, config: &ProcessConfig) -> Self {
        Self {
            name: name.to_string(),
            state: ProcessState::Stopped,
            pid: None,
            started_at: None,
            uptime: None,
            restart_count: 0,
            restart_policy: config.restart_policy,
            healthy: None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ProcessState::Running | ProcessState::Unhealthy)
    }
}
