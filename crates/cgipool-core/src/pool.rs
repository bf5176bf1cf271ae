//! Worker pool configuration.
//!
//! A pool runs N copies of one command, each bound to its own port. The
//! port is handed to the worker either through a `{port}` placeholder in
//! the command template or, when no placeholder is present, as the final
//! argument (the CGI convention: `./build/search.cgi 8000`).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::{ConfigError, ConfigResult};
use crate::health::HealthCheckSpec;

/// Placeholder substituted with the worker's port.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// First port handed out when a pool does not name one.
pub const DEFAULT_BASE_PORT: u16 = 8000;

/// The command used to launch one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated invocation such as `python3 app.py`.
    pub fn parse(invocation: &str) -> Option<Self> {
        let mut parts = invocation.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Arguments for a worker bound to `port`.
    pub fn args_for_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        if self.args.iter().any(|a| a.contains(PORT_PLACEHOLDER)) {
            self.args
                .iter()
                .map(|a| a.replace(PORT_PLACEHOLDER, &port))
                .collect()
        } else {
            let mut args = self.args.clone();
            args.push(port);
            args
        }
    }

    /// The full command line for `port`, for logging.
    pub fn display_for_port(&self, port: u16) -> String {
        let mut line = self.program.clone();
        for arg in self.args_for_port(port) {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

/// How a worker's readiness and health are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerProbeKind {
    /// GET the worker's health query and expect 200.
    #[default]
    Http,
    /// Plain TCP connect to the worker's port.
    Port,
}

/// Probe settings shared by every worker of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerProbe {
    pub kind: WorkerProbeKind,
    /// Path and query used by the periodic health check.
    pub health_query: String,
    /// Path and query used once, right after spawn.
    pub verify_query: String,
    /// Pause between launching a worker and verifying it.
    #[serde(with = "duration")]
    pub settle: Duration,
    #[serde(with = "duration")]
    pub verify_timeout: Duration,
    #[serde(with = "duration")]
    pub check_timeout: Duration,
}

impl Default for WorkerProbe {
    fn default() -> Self {
        Self {
            kind: WorkerProbeKind::Http,
            health_query: "/?q=health".to_string(),
            verify_query: "/?q=healthcheck".to_string(),
            settle: Duration::from_millis(200),
            verify_timeout: Duration::from_secs(1),
            check_timeout: Duration::from_millis(500),
        }
    }
}

impl WorkerProbe {
    /// Probe run once after spawning a worker on `port`.
    pub fn verify_spec(&self, port: u16) -> HealthCheckSpec {
        self.spec_for(port, &self.verify_query, self.verify_timeout)
    }

    /// Probe run on every registry cycle for the worker on `port`.
    pub fn check_spec(&self, port: u16) -> HealthCheckSpec {
        self.spec_for(port, &self.health_query, self.check_timeout)
    }

    fn spec_for(&self, port: u16, query: &str, timeout: Duration) -> HealthCheckSpec {
        match self.kind {
            WorkerProbeKind::Port => HealthCheckSpec::port(port, timeout),
            WorkerProbeKind::Http => {
                let query = if query.starts_with('/') {
                    query.to_string()
                } else {
                    format!("/{query}")
                };
                HealthCheckSpec::http(format!("http://127.0.0.1:{port}{query}"), timeout)
            }
        }
    }
}

/// Configuration for one elastic worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Service name, also the upstream name in the published artifact.
    pub name: String,
    pub command: CommandTemplate,
    pub min: usize,
    pub max: usize,
    /// First port allocated; later ports count upward from here.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    #[serde(default)]
    pub probe: WorkerProbe,
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, command: CommandTemplate, min: usize, max: usize) -> Self {
        Self {
            name: name.into(),
            command,
            min,
            max,
            base_port: DEFAULT_BASE_PORT,
            probe: WorkerProbe::default(),
        }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("<pool>", "pool name is empty"));
        }
        if self.command.program.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "command program is empty"));
        }
        if self.max == 0 {
            return Err(ConfigError::invalid(&self.name, "max must be at least 1"));
        }
        if self.min > self.max {
            return Err(ConfigError::invalid(
                &self.name,
                format!("min ({}) exceeds max ({})", self.min, self.max),
            ));
        }
        if self.base_port == 0 {
            return Err(ConfigError::invalid(&self.name, "base_port must be non-zero"));
        }
        Ok(())
    }
}

/// Validate a full set of pools: each pool individually, plus unique names
/// and unique base ports.
pub fn validate_pools(pools: &[PoolConfig]) -> ConfigResult<()> {
    if pools.is_empty() {
        return Err(ConfigError::Empty("pools"));
    }
    let mut seen = HashSet::new();
    let mut base_ports: HashMap<u16, &str> = HashMap::new();
    for pool in pools {
        pool.validate()?;
        if !seen.insert(pool.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "pool",
                name: pool.name.clone(),
            });
        }
        if let Some(other) = base_ports.insert(pool.base_port, pool.name.as_str()) {
            return Err(ConfigError::invalid(
                &pool.name,
                format!("base_port {} is already used by pool `{other}`", pool.base_port),
            ));
        }
    }
    Ok(())
}

/// Static pool configuration file (`pools.toml`).
///
/// ```toml
/// [[pool]]
/// name = "search"
/// command = { program = "./build/search.cgi" }
/// min = 2
/// max = 5
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsFile {
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolConfig>,
}

impl PoolsFile {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = read(path)?;
        let file: PoolsFile = toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })?;
        validate_pools(&file.pools)?;
        Ok(file)
    }
}

pub(crate) fn read(path: &Path) -> ConfigResult<String> {
    if !path.exists() {
        return Err(ConfigError::NotFound(PathBuf::from(path)));
    }
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
