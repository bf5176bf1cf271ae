//! Service manifest (`discovery/manifest.json`) and its translation into
//! pool configurations.
//!
//! Translation rules:
//! - `c` samples run `<build_dir>/<executable>` (default `<name>.cgi`);
//!   two or more candidate ports give `min = 2, max = ports + 1`, otherwise
//!   `min = 1, max = 3`.
//! - `python` samples run `python3 <path>` with `min = 1, max = 3`.
//!
//! Samples that name no ports get consecutive 100-port blocks starting
//! above the highest port any sample claims.
//!
//! Samples whose executable is missing on disk, and samples in other
//! languages, are reported as skipped rather than failing the whole load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::pool::{CommandTemplate, DEFAULT_BASE_PORT, PoolConfig, read};

/// Port stride between pools whose manifest entry names no candidate ports.
const PORT_BLOCK: u16 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub samples: BTreeMap<String, Sample>,
}

/// One service entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub language: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub default_ports: Vec<u16>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
}

/// A manifest entry that produced no pool, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSample {
    pub name: String,
    pub reason: String,
}

impl Manifest {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = read(path)?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve every sample into a pool configuration.
    ///
    /// Relative C executables resolve against `build_dir`; Python paths are
    /// used as written. `exists` decides whether an executable is present.
    pub fn pool_configs(
        &self,
        build_dir: &Path,
        exists: impl Fn(&Path) -> bool,
    ) -> (Vec<PoolConfig>, Vec<SkippedSample>) {
        let mut pools = Vec::new();
        let mut skipped = Vec::new();
        let mut next_block = self.first_free_block();

        for (name, sample) in &self.samples {
            let resolved = match sample.language.as_str() {
                "c" => {
                    let exec_name = sample
                        .executable
                        .clone()
                        .unwrap_or_else(|| format!("{name}.cgi"));
                    let exec_path = build_dir.join(exec_name);
                    let (min, max) = if sample.default_ports.len() >= 2 {
                        (2, sample.default_ports.len() + 1)
                    } else {
                        (1, 3)
                    };
                    let command = CommandTemplate::new(exec_path.display().to_string(), vec![]);
                    Some((exec_path, command, min, max))
                }
                "python" => match &sample.path {
                    Some(path) => Some((
                        path.clone(),
                        CommandTemplate::new("python3", vec![path.display().to_string()]),
                        1,
                        3,
                    )),
                    None => {
                        skipped.push(SkippedSample {
                            name: name.clone(),
                            reason: "python sample has no path".to_string(),
                        });
                        None
                    }
                },
                other => {
                    skipped.push(SkippedSample {
                        name: name.clone(),
                        reason: format!("unsupported language `{other}`"),
                    });
                    None
                }
            };

            let Some((exec_path, command, min, max)) = resolved else {
                continue;
            };

            if !exists(&exec_path) {
                skipped.push(SkippedSample {
                    name: name.clone(),
                    reason: format!("{} not found", exec_path.display()),
                });
                continue;
            }

            let base_port = match sample.default_ports.first() {
                Some(&port) => port,
                None => match u16::try_from(next_block) {
                    Ok(port) => {
                        next_block += u32::from(PORT_BLOCK);
                        port
                    }
                    Err(_) => {
                        skipped.push(SkippedSample {
                            name: name.clone(),
                            reason: "no free port block left".to_string(),
                        });
                        continue;
                    }
                },
            };

            debug!(
                service = %name,
                command = %command.display_for_port(base_port),
                min,
                max,
                "resolved pool from manifest"
            );
            pools.push(PoolConfig::new(name.clone(), command, min, max).with_base_port(base_port));
        }

        (pools, skipped)
    }

    /// Start of the first port block above every port a sample claims, and
    /// never below [`DEFAULT_BASE_PORT`].
    fn first_free_block(&self) -> u32 {
        let block = u32::from(PORT_BLOCK);
        let above_claimed = self
            .samples
            .values()
            .flat_map(|s| s.default_ports.iter().copied())
            .max()
            .map_or(0, |port| (u32::from(port) / block + 1) * block);
        above_claimed.max(u32::from(DEFAULT_BASE_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "samples": {
            "search": {
                "name": "Search",
                "language": "c",
                "path": "discovery/samples/c/search.c",
                "executable": "search.cgi",
                "default_ports": [8000, 8001, 8002]
            },
            "auth": {
                "language": "c",
                "path": "discovery/samples/c/auth.c"
            },
            "python-cgi": {
                "language": "python",
                "path": "discovery/samples/python/sample_python_cgi.py",
                "default_ports": [8200]
            },
            "csharp-cgi": {
                "language": "csharp",
                "path": "discovery/samples/csharp/sample.csx"
            }
        }
    }"#;

    fn manifest() -> Manifest {
        serde_json::from_str(MANIFEST).unwrap()
    }

    #[test]
    fn resolves_c_and_python_samples() {
        let (pools, skipped) = manifest().pool_configs(Path::new("./build"), |_| true);
        let by_name: BTreeMap<_, _> = pools.iter().map(|p| (p.name.as_str(), p)).collect();

        let search = by_name["search"];
        assert_eq!(search.command.program, "./build/search.cgi");
        assert_eq!((search.min, search.max), (2, 4));
        assert_eq!(search.base_port, 8000);

        let auth = by_name["auth"];
        assert_eq!(auth.command.program, "./build/auth.cgi");
        assert_eq!((auth.min, auth.max), (1, 3));
        // Above python-cgi's 8200, the highest claimed port.
        assert_eq!(auth.base_port, 8300);

        let python = by_name["python-cgi"];
        assert_eq!(python.command.program, "python3");
        assert_eq!(
            python.command.args,
            vec!["discovery/samples/python/sample_python_cgi.py"]
        );
        assert_eq!(python.base_port, 8200);

        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "csharp-cgi");
    }

    #[test]
    fn missing_executables_are_skipped() {
        let (pools, skipped) = manifest().pool_configs(Path::new("./build"), |p| {
            !p.ends_with("auth.cgi")
        });
        assert!(pools.iter().all(|p| p.name != "auth"));
        assert!(skipped.iter().any(|s| s.name == "auth" && s.reason.contains("not found")));
    }

    #[test]
    fn pools_without_ports_get_distinct_blocks() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"samples": {
                "a": {"language": "c"},
                "b": {"language": "c"}
            }}"#,
        )
        .unwrap();
        let (pools, _) = manifest.pool_configs(Path::new("build"), |_| true);
        assert_eq!(pools[0].base_port, 8000);
        assert_eq!(pools[1].base_port, 8100);
    }

    #[test]
    fn fallback_block_skips_claimed_ports() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"samples": {
                "search": {"language": "c", "default_ports": [8000, 8001, 8002]},
                "auth": {"language": "c"}
            }}"#,
        )
        .unwrap();
        let (pools, skipped) = manifest.pool_configs(Path::new("build"), |_| true);
        assert!(skipped.is_empty());

        let by_name: BTreeMap<_, _> = pools.iter().map(|p| (p.name.as_str(), p)).collect();
        assert_eq!(by_name["search"].base_port, 8000);
        assert_eq!(by_name["auth"].base_port, 8100);
        crate::pool::validate_pools(&pools).unwrap();
    }

    #[test]
    fn no_block_left_above_high_ports() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"samples": {
                "edge": {"language": "c", "default_ports": [65500]},
                "auth": {"language": "c"}
            }}"#,
        )
        .unwrap();
        let (pools, skipped) = manifest.pool_configs(Path::new("build"), |_| true);
        assert_eq!(pools.len(), 1);
        assert_eq!(skipped[0].name, "auth");
        assert!(skipped[0].reason.contains("no free port block"));
    }

    #[test]
    fn reads_manifest_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, MANIFEST).unwrap();
        assert_eq!(Manifest::from_file(&path).unwrap().samples.len(), 4);
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let err = Manifest::from_file(Path::new("/nonexistent/manifest.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
