//! Supervisor configuration: named long-lived processes and global settings.
//!
//! The file format is JSON (`ops/process_config.json`) or TOML, chosen by
//! extension:
//!
//! ```json
//! {
//!   "processes": {
//!     "pool_manager": {
//!       "command": ["cgipoold", "pool"],
//!       "restart_policy": "always",
//!       "health_check": { "type": "port", "target": "8000", "timeout": 5 }
//!     }
//!   },
//!   "global_settings": { "shutdown_timeout": 10 }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::duration;
use crate::error::{ConfigError, ConfigResult};
use crate::health::HealthCheckSpec;
use crate::pool::read;

/// What the supervisor does when a process dies or turns unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Dead processes are dropped from tracking.
    #[default]
    #[serde(alias = "no")]
    Never,
    /// Restart on death, not on a failed health check.
    OnFailure,
    /// Restart on death and on a failed health check.
    Always,
}

impl RestartPolicy {
    pub fn restarts_on_exit(self) -> bool {
        matches!(self, Self::OnFailure | Self::Always)
    }

    pub fn restarts_on_unhealthy(self) -> bool {
        self == Self::Always
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::OnFailure => f.write_str("on-failure"),
            Self::Always => f.write_str("always"),
        }
    }
}

/// One supervised process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// argv; the first element is the program.
    pub command: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, with = "duration")]
    pub startup_delay: Duration,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

impl ProcessConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            cwd: default_cwd(),
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::Never,
            depends_on: Vec::new(),
            startup_delay: Duration::ZERO,
            health_check: None,
        }
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn health_check(mut self, spec: HealthCheckSpec) -> Self {
        self.health_check = Some(spec);
        self
    }

    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Settings that apply to the whole supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Upper bound on launching + verifying a single process.
    #[serde(with = "duration")]
    pub startup_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,
    /// Interval of the monitoring loop.
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
    /// Per-process stdout/stderr logs land here as `<name>.log`.
    pub log_directory: PathBuf,
    /// Command-line regexes identifying processes left over from a prior run.
    pub orphan_patterns: Vec<String>,
    /// Reclaim orphans before starting anything.
    pub reclaim_orphans_on_start: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            log_directory: PathBuf::from("logs"),
            orphan_patterns: default_orphan_patterns(),
            reclaim_orphans_on_start: true,
        }
    }
}

/// Executables known to belong to this system.
pub fn default_orphan_patterns() -> Vec<String> {
    [
        r"\.cgi",
        r"sample_python_cgi\.py",
        r"sample_csharp_cgi\.csx",
        r"dotnet-script.*\.csx",
        r"cgipoold pool",
        r"dotnet run.*8080",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// The full supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub processes: BTreeMap<String, ProcessConfig>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl SupervisorConfig {
    /// Load and validate a JSON or TOML config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = read(path)?;
        let config: SupervisorConfig = if is_toml(path) {
            toml::from_str(&content).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            serde_json::from_str(&content).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?
        };
        config.validate()?;
        debug!(path = %path.display(), processes = config.processes.len(), "supervisor config loaded");
        Ok(config)
    }

    /// Write the config in the format implied by `path`'s extension.
    pub fn write_to(&self, path: &Path) -> ConfigResult<()> {
        let content = if is_toml(path) {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The stock two-process layout: the pool daemon, then the reverse
    /// proxy that routes to it.
    pub fn scaffold() -> Self {
        let mut processes = BTreeMap::new();
        processes.insert(
            "pool_manager".to_string(),
            ProcessConfig::new(["cgipoold", "pool"])
                .restart_policy(RestartPolicy::Always)
                .health_check(HealthCheckSpec::port(8000, Duration::from_secs(5))),
        );
        processes.insert(
            "yarp_proxy".to_string(),
            ProcessConfig::new(["dotnet", "run", "--urls=http://0.0.0.0:8080"])
                .cwd("proxy/CGIProxy")
                .restart_policy(RestartPolicy::Always)
                .startup_delay(Duration::from_secs(2))
                .depends_on(["pool_manager"])
                .health_check(HealthCheckSpec::http(
                    "http://localhost:8080/admin",
                    Duration::from_secs(5),
                )),
        );
        Self {
            processes,
            global_settings: GlobalSettings::default(),
        }
    }

    /// Structural checks. Dependency names must refer to configured
    /// processes; cycles are left to the startup algorithm.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.processes.is_empty() {
            return Err(ConfigError::Empty("processes"));
        }
        for (name, process) in &self.processes {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("<process>", "process name is empty"));
            }
            match process.command.first() {
                Some(program) if !program.trim().is_empty() => {}
                _ => return Err(ConfigError::invalid(name, "command is empty")),
            }
            let mut deps = HashSet::new();
            for dep in &process.depends_on {
                if !self.processes.contains_key(dep) {
                    return Err(ConfigError::invalid(
                        name,
                        format!("depends on unknown process `{dep}`"),
                    ));
                }
                if !deps.insert(dep.as_str()) {
                    return Err(ConfigError::invalid(
                        name,
                        format!("lists dependency `{dep}` twice"),
                    ));
                }
            }
        }
        let settings = &self.global_settings;
        if settings.shutdown_timeout.is_zero() {
            return Err(ConfigError::invalid("global_settings", "shutdown_timeout is zero"));
        }
        if settings.health_check_interval.is_zero() {
            return Err(ConfigError::invalid(
                "global_settings",
                "health_check_interval is zero",
            ));
        }
        for pattern in &settings.orphan_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::invalid(
                    "global_settings",
                    format!("orphan pattern `{pattern}` is not a valid regex: {e}"),
                ));
            }
        }
        Ok(())
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "toml")
}
