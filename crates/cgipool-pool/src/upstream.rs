//! Upstream publication: healthy endpoints as an nginx `upstream` file.
//!
//! The artifact is rendered from scratch every cycle and contains no
//! timestamps, so two cycles over the same healthy set produce identical
//! bytes. Writes go to a sibling temp file and are renamed into place, so a
//! reader never sees a half-written file.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{PoolError, PoolResult};

/// Default location of the published upstream file.
pub const DEFAULT_UPSTREAM_PATH: &str = "/tmp/cgi_upstreams.conf";

const HEADER: &str = "# Auto-generated upstream configuration";

/// One reachable worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn local(port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Render the upstream file for `services`.
///
/// Services without endpoints are omitted. Output order follows the map's
/// key order and each service's endpoint order.
pub fn render_upstreams(services: &BTreeMap<String, Vec<Endpoint>>) -> String {
    let mut out = String::new();
    out.push_str(HEADER);
    out.push_str("\n\n");
    for (service, endpoints) in services {
        if endpoints.is_empty() {
            continue;
        }
        let _ = writeln!(out, "upstream {service}_pool {{");
        out.push_str("    least_conn;\n");
        for endpoint in endpoints {
            let _ = writeln!(out, "    server {endpoint} max_fails=3 fail_timeout=10s;");
        }
        out.push_str("}\n\n");
    }
    out
}

/// Outcome of one publication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Services that made it into the file.
    pub services: usize,
    pub endpoints: usize,
    /// Whether the file content differs from the previous publication.
    pub changed: bool,
}

/// The published artifact on disk.
#[derive(Debug, Clone)]
pub struct UpstreamFile {
    path: PathBuf,
}

impl UpstreamFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file with `content`.
    pub fn write(&self, content: &str) -> PoolResult<()> {
        let tmp = self.tmp_path();
        let publish_err = |source| PoolError::Publish {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(publish_err)?;
        }
        std::fs::write(&tmp, content).map_err(publish_err)?;
        std::fs::rename(&tmp, &self.path).map_err(|source| {
            let _ = std::fs::remove_file(&tmp);
            publish_err(source)
        })?;
        debug!(path = %self.path.display(), bytes = content.len(), "upstream file written");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Default for UpstreamFile {
    fn default() -> Self {
        Self::new(DEFAULT_UPSTREAM_PATH)
    }
}
