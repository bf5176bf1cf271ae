//! Pool mode — runs the worker pool registry.
//!
//! 1. Resolve pool configurations from the manifest or a TOML pool file
//! 2. Start every pool at its minimum and publish upstreams
//! 3. Run the registry cycle until SIGINT/SIGTERM
//! 4. Terminate every worker, then exit

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use cgipool_core::{Manifest, PoolConfig, PoolsFile};
use cgipool_health::HealthChecker;
use cgipool_pool::{PoolRegistry, ProcessLauncher, UpstreamFile};

use crate::shutdown::ShutdownSignals;

pub enum PoolSource {
    Manifest { path: PathBuf, build_dir: PathBuf },
    Config(PathBuf),
}

pub struct PoolOptions {
    pub source: PoolSource,
    pub upstream_file: PathBuf,
    pub interval: Duration,
    pub log_dir: Option<PathBuf>,
}

/// Pool configurations from `source`. Skipped manifest entries are logged.
pub fn load_pools(source: &PoolSource) -> anyhow::Result<Vec<PoolConfig>> {
    match source {
        PoolSource::Config(path) => {
            let file = PoolsFile::from_file(path)
                .with_context(|| format!("loading pool file {}", path.display()))?;
            Ok(file.pools)
        }
        PoolSource::Manifest { path, build_dir } => {
            let manifest = Manifest::from_file(path)
                .with_context(|| format!("loading manifest {}", path.display()))?;
            let (pools, skipped) = manifest.pool_configs(build_dir, Path::exists);
            for sample in &skipped {
                warn!(sample = %sample.name, reason = %sample.reason, "sample skipped");
            }
            anyhow::ensure!(
                !pools.is_empty(),
                "manifest {} yields no runnable pools",
                path.display()
            );
            Ok(pools)
        }
    }
}

pub async fn run(options: PoolOptions) -> anyhow::Result<()> {
    info!("cgipool daemon starting in pool mode");
    let signals = ShutdownSignals::install().context("installing signal handlers")?;

    let pools = load_pools(&options.source)?;

    let mut launcher = ProcessLauncher::new();
    if let Some(dir) = &options.log_dir {
        launcher = launcher.with_log_dir(dir);
    }
    let registry = PoolRegistry::from_configs(
        pools,
        Arc::new(launcher),
        Arc::new(HealthChecker::new()),
        UpstreamFile::new(&options.upstream_file),
    )?;
    let registry = Arc::new(registry);

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_handle = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            signals.recv().await;
            let _ = shutdown_tx.send(true);
            registry.shutdown().await;
        })
    };

    // ── Initial fill ───────────────────────────────────────────
    if let Err(e) = registry.start().await {
        registry.shutdown().await;
        return Err(e).context("starting pools");
    }
    for status in registry.status().await {
        info!(
            service = %status.service,
            healthy = status.healthy(),
            min = status.min,
            max = status.max,
            "pool ready"
        );
    }

    // ── Registry cycle ─────────────────────────────────────────
    let cycle_handle = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.run(options.interval, shutdown_rx).await })
    };

    let _ = cycle_handle.await;
    let _ = signal_handle.await;

    info!("cgipool daemon stopped");
    Ok(())
}
