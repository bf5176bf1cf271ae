//! Worker pool — one elastic set of homogeneous workers for one service.
//!
//! All pool state lives behind a single mutex. The lock is held for every
//! mutation (reserving a port, inserting, evicting) but released across
//! health probes: `spawn` reserves a port and an in-flight slot, launches and
//! verifies without the lock, then re-locks to insert. In-flight spawns count
//! against `max`, so `workers.len() <= max` holds in every reachable state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use cgipool_core::PoolConfig;
use cgipool_health::HealthProbe;

use crate::launcher::{WorkerHandle, WorkerLauncher};
use crate::worker::{WorkerProcess, WorkerStatus};

/// Mean requests per worker above which `scale_up` adds a worker.
pub const SCALE_UP_THRESHOLD: f64 = 10.0;

struct PoolState {
    /// Next port to hand out. Only ever increases; `u32` so exhaustion of
    /// the `u16` port space is observable instead of wrapping.
    next_port: u32,
    /// Spawns that hold a reservation but have not been inserted yet.
    in_flight: usize,
    workers: BTreeMap<u16, WorkerProcess>,
    /// Set by `terminate_all`; no worker is admitted afterwards.
    closed: bool,
}

impl PoolState {
    fn allocate_port(&mut self) -> Option<u16> {
        let port = u16::try_from(self.next_port).ok()?;
        self.next_port += 1;
        Some(port)
    }

    fn occupied(&self) -> usize {
        self.workers.len() + self.in_flight
    }
}

/// An elastic pool of worker processes for one service.
pub struct WorkerPool {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        let next_port = u32::from(config.base_port);
        Self {
            config,
            launcher,
            probe,
            state: Mutex::new(PoolState {
                next_port,
                in_flight: 0,
                workers: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn one worker on the next port and verify it.
    ///
    /// Returns `None` without side effects when the pool is full. A failed
    /// launch or verification consumes the port but adds no worker.
    pub async fn spawn(&self) -> Option<u16> {
        let service = self.config.name.as_str();

        let port = {
            let mut state = self.state.lock().await;
            if state.closed {
                debug!(%service, "pool is shut down, not spawning");
                return None;
            }
            if state.occupied() >= self.config.max {
                warn!(%service, max = self.config.max, "max workers reached");
                return None;
            }
            let Some(port) = state.allocate_port() else {
                warn!(%service, "port space exhausted");
                return None;
            };
            state.in_flight += 1;
            port
        };

        let verified = self.launch_and_verify(port).await;

        let mut state = self.state.lock().await;
        state.in_flight -= 1;
        let mut handle = verified?;
        if state.closed {
            drop(state);
            debug!(%service, port, "pool shut down during spawn, discarding worker");
            handle.terminate().await;
            return None;
        }
        let worker = WorkerProcess::new(port, handle);
        info!(%service, port, pid = worker.pid(), "worker spawned");
        state.workers.insert(port, worker);
        Some(port)
    }

    async fn launch_and_verify(&self, port: u16) -> Option<Box<dyn WorkerHandle>> {
        let service = self.config.name.as_str();
        let mut handle = match self
            .launcher
            .launch(service, &self.config.command, port)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%service, port, error = %e, "failed to spawn worker");
                return None;
            }
        };

        if !self.config.probe.settle.is_zero() {
            tokio::time::sleep(self.config.probe.settle).await;
        }

        let spec = self.config.probe.verify_spec(port);
        if self.probe.probe(&spec).await {
            Some(handle)
        } else {
            warn!(%service, port, target = %spec.target, "failed to verify worker, terminating");
            handle.terminate().await;
            None
        }
    }

    /// Check every worker; evict the dead and the failing in the same pass.
    ///
    /// Liveness is read under the lock; probes run in parallel without it;
    /// evictions are applied under it. Returns the number of evicted workers.
    pub async fn health_check(&self) -> usize {
        let service = self.config.name.clone();

        let (mut failed, alive) = {
            let mut state = self.state.lock().await;
            let mut dead = Vec::new();
            let mut alive = Vec::new();
            for (port, worker) in state.workers.iter_mut() {
                if worker.has_exited() {
                    worker.set_healthy(false);
                    dead.push(*port);
                } else {
                    alive.push(*port);
                }
            }
            (dead, alive)
        };

        let mut probes = JoinSet::new();
        for port in alive {
            let probe = Arc::clone(&self.probe);
            let spec = self.config.probe.check_spec(port);
            probes.spawn(async move { (port, probe.probe(&spec).await) });
        }
        let mut passed = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((port, true)) => passed.push(port),
                Ok((port, false)) => failed.push(port),
                Err(e) => warn!(%service, error = %e, "health probe task failed"),
            }
        }

        let evicted = {
            let mut state = self.state.lock().await;
            for port in passed {
                if let Some(worker) = state.workers.get_mut(&port) {
                    worker.set_healthy(true);
                }
            }
            let mut evicted = Vec::new();
            for port in failed {
                if let Some(worker) = state.workers.remove(&port) {
                    warn!(%service, port, pid = worker.pid(), "worker unhealthy, removing");
                    evicted.push(worker);
                }
            }
            evicted
        };
        let count = evicted.len();
        terminate_workers(evicted).await;
        count
    }

    /// Spawn until `min` healthy workers exist, with at most `min` attempts.
    ///
    /// Returns the number of workers added.
    pub async fn ensure_minimum(&self) -> usize {
        let mut healthy = self.healthy_count().await;
        let mut attempts = 0;
        let mut spawned = 0;
        while healthy < self.config.min && attempts < self.config.min {
            if self.spawn().await.is_some() {
                healthy += 1;
                spawned += 1;
            }
            attempts += 1;
        }
        if healthy < self.config.min {
            warn!(
                service = %self.config.name,
                healthy,
                min = self.config.min,
                attempts,
                "pool below minimum after bounded respawn"
            );
        }
        spawned
    }

    /// Add one worker if the mean request count exceeds the threshold.
    pub async fn scale_up(&self) -> Option<u16> {
        let mean = {
            let state = self.state.lock().await;
            if state.closed || state.occupied() >= self.config.max {
                return None;
            }
            let total: u64 = state.workers.values().map(WorkerProcess::request_count).sum();
            total as f64 / state.workers.len().max(1) as f64
        };
        if mean <= SCALE_UP_THRESHOLD {
            return None;
        }
        info!(service = %self.config.name, mean_requests = mean, "scaling up");
        self.spawn().await
    }

    /// Terminate every worker and clear the pool. Returns once every worker
    /// process is gone. The pool admits no new workers afterwards.
    pub async fn terminate_all(&self) -> usize {
        let workers = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.workers)
        };
        let count = workers.len();
        for (port, worker) in &workers {
            info!(service = %self.config.name, port, pid = worker.pid(), "terminating worker");
        }
        terminate_workers(workers.into_values()).await;
        count
    }

    /// Add `count` served requests to the worker on `port`.
    ///
    /// Returns `false` if no such worker is tracked.
    pub async fn record_requests(&self, port: u16, count: u64) -> bool {
        let mut state = self.state.lock().await;
        match state.workers.get_mut(&port) {
            Some(worker) => {
                worker.add_requests(count);
                true
            }
            None => false,
        }
    }

    pub async fn healthy_count(&self) -> usize {
        let state = self.state.lock().await;
        state.workers.values().filter(|w| w.is_healthy()).count()
    }

    /// Ports of healthy workers, ascending.
    pub async fn healthy_ports(&self) -> Vec<u16> {
        let state = self.state.lock().await;
        state
            .workers
            .values()
            .filter(|w| w.is_healthy())
            .map(WorkerProcess::port)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            service: self.config.name.clone(),
            min: self.config.min,
            max: self.config.max,
            next_port: state.next_port,
            in_flight: state.in_flight,
            workers: state.workers.values().map(WorkerProcess::status).collect(),
        }
    }
}

/// Terminate `workers` concurrently and wait for all of them.
async fn terminate_workers(workers: impl IntoIterator<Item = WorkerProcess>) {
    let mut stopping = JoinSet::new();
    for worker in workers {
        stopping.spawn(worker.terminate());
    }
    while let Some(joined) = stopping.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "worker termination task failed");
        }
    }
}

/// Snapshot of a pool for status output.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub service: String,
    pub min: usize,
    pub max: usize,
    pub next_port: u32,
    pub in_flight: usize,
    pub workers: Vec<WorkerStatus>,
}

impl PoolStatus {
    pub fn healthy(&self) -> usize {
        self.workers.iter().filter(|w| w.healthy).count()
    }

    pub fn oldest_uptime(&self) -> Option<Duration> {
        self.workers.iter().map(|w| w.uptime).max()
    }
}
