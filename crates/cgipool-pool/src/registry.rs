//! Pool registry — every pool by service name, plus the periodic cycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use cgipool_core::{PoolConfig, validate_pools};
use cgipool_health::HealthProbe;

use crate::error::{PoolError, PoolResult};
use crate::launcher::WorkerLauncher;
use crate::pool::{PoolStatus, WorkerPool};
use crate::upstream::{Endpoint, PublishReport, UpstreamFile, render_upstreams};

/// Default interval between registry cycles.
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_secs(5);

/// What one cycle did, summed over every pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub evicted: usize,
    pub spawned: usize,
    pub scaled: usize,
    /// `None` if publishing failed.
    pub publish: Option<PublishReport>,
}

/// Owns every [`WorkerPool`] and the upstream file they publish to.
pub struct PoolRegistry {
    pools: BTreeMap<String, Arc<WorkerPool>>,
    publisher: UpstreamFile,
    last_published: Mutex<Option<String>>,
    shut_down: AtomicBool,
}

impl PoolRegistry {
    pub fn new(publisher: UpstreamFile) -> Self {
        Self {
            pools: BTreeMap::new(),
            publisher,
            last_published: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Validate `configs` and build one pool per entry, all sharing
    /// `launcher` and `probe`.
    pub fn from_configs(
        configs: Vec<PoolConfig>,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn HealthProbe>,
        publisher: UpstreamFile,
    ) -> PoolResult<Self> {
        validate_pools(&configs)?;
        let mut registry = Self::new(publisher);
        for config in configs {
            let pool = WorkerPool::new(config, Arc::clone(&launcher), Arc::clone(&probe));
            registry.add_pool(pool)?;
        }
        Ok(registry)
    }

    pub fn add_pool(&mut self, pool: WorkerPool) -> PoolResult<()> {
        let name = pool.name().to_string();
        if self.pools.contains_key(&name) {
            return Err(PoolError::DuplicatePool(name));
        }
        info!(
            service = %name,
            min = pool.config().min,
            max = pool.config().max,
            base_port = pool.config().base_port,
            "pool registered"
        );
        self.pools.insert(name, Arc::new(pool));
        Ok(())
    }

    pub fn pool(&self, service: &str) -> Option<&Arc<WorkerPool>> {
        self.pools.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub fn upstream_file(&self) -> &UpstreamFile {
        &self.publisher
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Bring every pool up to its minimum, then publish once.
    pub async fn start(&self) -> PoolResult<PublishReport> {
        for (service, pool) in &self.pools {
            let spawned = pool.ensure_minimum().await;
            info!(%service, spawned, healthy = pool.healthy_count().await, "pool started");
        }
        self.publish().await
    }

    /// One pass over every pool: health check, top up, scale, publish.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        if self.is_shut_down() {
            return report;
        }
        for (service, pool) in &self.pools {
            report.evicted += pool.health_check().await;
            report.spawned += pool.ensure_minimum().await;
            if let Some(port) = pool.scale_up().await {
                info!(%service, port, "scaled up");
                report.scaled += 1;
            }
        }
        let mut last = self.last_published.lock().await;
        // Shutdown may have published the empty set while this cycle ran.
        if self.is_shut_down() {
            return report;
        }
        match self.publish_locked(&mut last).await {
            Ok(published) => report.publish = Some(published),
            Err(e) => error!(error = %e, "failed to publish upstreams"),
        }
        report
    }

    /// Healthy endpoints per service, ascending by port.
    pub async fn endpoints(&self) -> BTreeMap<String, Vec<Endpoint>> {
        let mut endpoints = BTreeMap::new();
        for (service, pool) in &self.pools {
            let ports = pool.healthy_ports().await;
            endpoints.insert(
                service.clone(),
                ports.into_iter().map(Endpoint::local).collect(),
            );
        }
        endpoints
    }

    /// Render and write the upstream file.
    pub async fn publish(&self) -> PoolResult<PublishReport> {
        let mut last = self.last_published.lock().await;
        self.publish_locked(&mut last).await
    }

    /// Snapshot and write while the caller holds `last_published`, so
    /// publications never interleave.
    async fn publish_locked(&self, last: &mut Option<String>) -> PoolResult<PublishReport> {
        let endpoints = self.endpoints().await;
        let content = render_upstreams(&endpoints);

        self.publisher.write(&content)?;
        let changed = last.as_deref() != Some(content.as_str());
        *last = Some(content);

        let report = PublishReport {
            services: endpoints.values().filter(|e| !e.is_empty()).count(),
            endpoints: endpoints.values().map(Vec::len).sum(),
            changed,
        };
        if changed {
            info!(
                path = %self.publisher.path().display(),
                services = report.services,
                endpoints = report.endpoints,
                "upstreams published"
            );
        }
        Ok(report)
    }

    pub async fn status(&self) -> Vec<PoolStatus> {
        let mut statuses = Vec::with_capacity(self.pools.len());
        for pool in self.pools.values() {
            statuses.push(pool.status().await);
        }
        statuses
    }

    /// Run cycles every `interval` until `shutdown` changes.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            pools = self.pools.len(),
            "pool registry started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.run_cycle().await;
                    if report.evicted > 0 || report.spawned > 0 || report.scaled > 0 {
                        info!(
                            evicted = report.evicted,
                            spawned = report.spawned,
                            scaled = report.scaled,
                            "cycle complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("pool registry shutting down");
                    break;
                }
            }
        }
    }

    /// Terminate every worker in every pool. Only the first call acts.
    ///
    /// Returns the number of workers terminated.
    pub async fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut terminated = 0;
        for pool in self.pools.values() {
            terminated += pool.terminate_all().await;
        }
        if let Err(e) = self.publish().await {
            warn!(error = %e, "failed to clear upstreams on shutdown");
        }
        info!(terminated, "all pools shut down");
        terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgipool_core::{CommandTemplate, WorkerProbe};
    use cgipool_health::ScriptedProbe;

    use crate::launcher::ProcessLauncher;
    use crate::testing::{FakeLauncher, running};

    fn config(name: &str, min: usize, max: usize, base_port: u16) -> PoolConfig {
        let mut config = PoolConfig::new(
            name,
            CommandTemplate::new(format!("./build/{name}.cgi"), vec![]),
            min,
            max,
        )
        .with_base_port(base_port);
        config.probe = WorkerProbe {
            settle: Duration::ZERO,
            ..WorkerProbe::default()
        };
        config
    }

    struct Fixture {
        registry: PoolRegistry,
        launcher: Arc<FakeLauncher>,
        probe: Arc<ScriptedProbe>,
        _dir: tempfile::TempDir,
    }

    fn fixture(configs: Vec<PoolConfig>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FakeLauncher::new();
        let probe = Arc::new(ScriptedProbe::new(true));
        let registry = PoolRegistry::from_configs(
            configs,
            launcher.clone(),
            probe.clone(),
            UpstreamFile::new(dir.path().join("upstreams.conf")),
        )
        .unwrap();
        Fixture {
            registry,
            launcher,
            probe,
            _dir: dir,
        }
    }

    fn published(fixture: &Fixture) -> String {
        std::fs::read_to_string(fixture.registry.upstream_file().path()).unwrap()
    }

    #[tokio::test]
    async fn start_fills_pools_and_publishes() {
        let f = fixture(vec![config("beta", 1, 3, 8100), config("alpha", 2, 3, 8000)]);
        let report = f.registry.start().await.unwrap();

        assert_eq!(report.services, 2);
        assert_eq!(report.endpoints, 3);
        let content = published(&f);
        assert!(content.contains("upstream alpha_pool {"));
        assert!(content.contains("server 127.0.0.1:8001 max_fails=3 fail_timeout=10s;"));
        assert!(content.find("alpha_pool").unwrap() < content.find("beta_pool").unwrap());
    }

    #[tokio::test]
    async fn publication_is_idempotent() {
        let f = fixture(vec![config("alpha", 2, 3, 8000)]);
        f.registry.start().await.unwrap();
        let first = published(&f);

        let report = f.registry.run_cycle().await;
        assert_eq!(published(&f), first);
        assert!(!report.publish.unwrap().changed);
    }

    #[tokio::test]
    async fn cycle_evicts_and_replaces() {
        let f = fixture(vec![config("alpha", 2, 3, 8000)]);
        f.registry.start().await.unwrap();

        f.launcher.kill(8000);
        let report = f.registry.run_cycle().await;

        assert_eq!(report.evicted, 1);
        assert_eq!(report.spawned, 1);
        assert!(report.publish.unwrap().changed);
        let content = published(&f);
        assert!(!content.contains(":8000 "));
        assert!(content.contains(":8002 "));
    }

    #[tokio::test]
    async fn service_without_healthy_workers_is_not_published() {
        let f = fixture(vec![config("alpha", 1, 2, 8000), config("beta", 1, 2, 8100)]);
        f.probe.set("http://127.0.0.1:8100/?q=healthcheck", false);
        f.registry.start().await.unwrap();

        let content = published(&f);
        assert!(content.contains("alpha_pool"));
        assert!(!content.contains("beta_pool"));
    }

    #[tokio::test]
    async fn duplicate_pools_rejected() {
        let mut registry = PoolRegistry::new(UpstreamFile::new("/nonexistent/upstreams.conf"));
        let launcher = FakeLauncher::new();
        let probe = Arc::new(ScriptedProbe::new(true));
        let pool = || WorkerPool::new(config("alpha", 1, 2, 8000), launcher.clone(), probe.clone());

        registry.add_pool(pool()).unwrap();
        assert!(matches!(
            registry.add_pool(pool()),
            Err(PoolError::DuplicatePool(name)) if name == "alpha"
        ));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let f = fixture(vec![config("alpha", 2, 3, 8000), config("beta", 1, 2, 8100)]);
        f.registry.start().await.unwrap();

        assert_eq!(f.registry.shutdown().await, 3);
        assert_eq!(f.registry.shutdown().await, 0);
        assert!(f.launcher.terminated(8000));
        assert!(f.launcher.terminated(8100));

        // Nothing comes back after shutdown.
        let report = f.registry.run_cycle().await;
        assert_eq!(report.spawned, 0);
        assert_eq!(f.launcher.launches(), 3);
        assert!(!published(&f).contains("_pool"));
    }

    #[tokio::test]
    async fn cycle_racing_shutdown_does_not_republish_workers() {
        let f = fixture(vec![config("alpha", 2, 3, 8000)]);
        let registry = Arc::new(f.registry);
        registry.start().await.unwrap();

        // Park a cycle right before it publishes.
        let held = registry.last_published.lock().await;
        let cycle = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let shutdown = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let report = cycle.await.unwrap();
        assert_eq!(shutdown.await.unwrap(), 2);
        assert!(report.publish.is_none());
        let content = std::fs::read_to_string(registry.upstream_file().path()).unwrap();
        assert!(!content.contains("server "));
    }

    #[tokio::test]
    async fn shutdown_waits_for_worker_process_groups() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!(
            "trap '' TERM; sleep 300 & echo $! > {}; wait",
            pid_file.display()
        );
        let mut config = PoolConfig::new(
            "stubborn",
            CommandTemplate::new("sh", vec!["-c".to_string(), script]),
            1,
            1,
        );
        config.probe = WorkerProbe {
            settle: Duration::ZERO,
            ..WorkerProbe::default()
        };
        let registry = PoolRegistry::from_configs(
            vec![config],
            Arc::new(ProcessLauncher::new().with_grace(Duration::from_millis(200))),
            Arc::new(ScriptedProbe::new(true)),
            UpstreamFile::new(dir.path().join("upstreams.conf")),
        )
        .unwrap();
        registry.start().await.unwrap();

        let status = registry.status().await;
        let leader = status[0].workers[0].pid.unwrap();
        for _ in 0..100 {
            if std::fs::read_to_string(&pid_file).is_ok_and(|s| s.ends_with('\n')) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        assert_eq!(registry.shutdown().await, 1);
        assert!(!running(leader), "leader {leader} alive after shutdown returned");
        let mut gone = false;
        for _ in 0..50 {
            if !running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived shutdown");
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let f = fixture(vec![config("alpha", 1, 2, 8000)]);
        let registry = Arc::new(f.registry);
        let (tx, rx) = watch::channel(false);

        let task = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.run(Duration::from_millis(10), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registry.pool("alpha").unwrap().healthy_count().await, 1);
    }
}
