//! cgipool-core — shared configuration types for cgipool.
//!
//! Everything the pool registry and the supervisor consume is described
//! here as typed, validated structures:
//!
//! - [`HealthCheckSpec`]: a port, HTTP or command probe with a timeout
//! - [`PoolConfig`]: one elastic worker pool (command template, min/max)
//! - [`SupervisorConfig`]: named long-lived processes plus global settings
//! - [`Manifest`]: the external service manifest, translated into pools
//!
//! Configuration is validated once at load time so that every structural
//! error surfaces before a single process is spawned.

pub mod duration;
pub mod error;
pub mod health;
pub mod manifest;
pub mod pool;
pub mod process;
#[cfg(unix)]
pub mod signal;

pub use error::{ConfigError, ConfigResult};
pub use health::{HealthCheckKind, HealthCheckSpec};
pub use manifest::{Manifest, Sample, SkippedSample};
pub use pool::{
    CommandTemplate, PoolConfig, PoolsFile, WorkerProbe, WorkerProbeKind, validate_pools,
};
pub use process::{GlobalSettings, ProcessConfig, RestartPolicy, SupervisorConfig};
