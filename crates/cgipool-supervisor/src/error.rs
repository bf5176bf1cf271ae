//! Supervisor error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while supervising processes.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process `{process}` depends on unknown process `{dependency}`")]
    DependencyMissing { process: String, dependency: String },

    #[error("dependency cycle among: {}", pending.join(", "))]
    DependencyCycle { pending: Vec<String> },

    #[error("process `{process}` cannot start: dependency `{dependency}` is not running")]
    DependencyNotRunning { process: String, dependency: String },

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("failed to spawn `{process}`: {source}")]
    Spawn {
        process: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process `{process}` exited during startup")]
    ExitedDuringStartup { process: String },

    #[error("process `{process}` failed its startup health check")]
    HealthCheckFailed { process: String },

    #[error("process `{process}` did not become ready within {timeout:?}")]
    StartupTimeout { process: String, timeout: Duration },

    #[error("invalid orphan pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("supervisor is shut down")]
    ShutDown,

    #[error("configuration error: {0}")]
    Config(#[from] cgipool_core::ConfigError),
}

impl SupervisorError {
    /// The process a startup failure is attributed to, if any.
    pub fn process(&self) -> Option<&str> {
        match self {
            Self::DependencyMissing { process, .. }
            | Self::DependencyNotRunning { process, .. }
            | Self::Spawn { process, .. }
            | Self::ExitedDuringStartup { process }
            | Self::HealthCheckFailed { process }
            | Self::StartupTimeout { process, .. } => Some(process),
            Self::UnknownProcess(name) => Some(name),
            _ => None,
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
