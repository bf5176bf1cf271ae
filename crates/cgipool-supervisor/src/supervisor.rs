//! The supervisor: dependency-ordered startup, policy-driven monitoring,
//! dependency-reversed shutdown.
//!
//! Tracked processes live in one `Vec` in start order, behind a single
//! mutex. Shutdown walks it backwards, so dependents stop before what they
//! depend on; restarts reinsert a process at its old position to keep that
//! order intact.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use cgipool_core::{GlobalSettings, ProcessConfig, SupervisorConfig};
use cgipool_health::HealthProbe;

use crate::error::{SupervisorError, SupervisorResult};
use crate::handle::{ProcessHandle, StopOutcome};
use crate::managed::{ManagedProcess, ProcessState, ProcessStatus};
use crate::orphan::{Exclusions, OrphanScanner};

/// What one monitoring pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub restarted: Vec<String>,
    /// Dead processes whose policy does not restart them.
    pub dropped: Vec<String>,
    /// Alive but failing health checks, kept per policy.
    pub unhealthy: Vec<String>,
    /// Restarts that were attempted and failed.
    pub failed: Vec<String>,
}

impl MonitorReport {
    pub fn is_quiet(&self) -> bool {
        self.restarted.is_empty()
            && self.dropped.is_empty()
            && self.unhealthy.is_empty()
            && self.failed.is_empty()
    }
}

pub struct Supervisor {
    processes: BTreeMap<String, ProcessConfig>,
    settings: GlobalSettings,
    probe: Arc<dyn HealthProbe>,
    orphans: OrphanScanner,
    tracked: Mutex<Vec<ManagedProcess>>,
    shut_down: AtomicBool,
}

impl Supervisor {
    /// Validate `config` and build an idle supervisor.
    pub fn new(config: SupervisorConfig, probe: Arc<dyn HealthProbe>) -> SupervisorResult<Self> {
        config.validate()?;
        let orphans = OrphanScanner::new(&config.global_settings.orphan_patterns)?;
        Ok(Self {
            processes: config.processes,
            settings: config.global_settings,
            probe,
            orphans,
            tracked: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SupervisorResult<()> {
        if self.is_shut_down() {
            return Err(SupervisorError::ShutDown);
        }
        Ok(())
    }

    fn config_of(&self, name: &str) -> SupervisorResult<&ProcessConfig> {
        self.processes
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownProcess(name.to_string()))
    }

    /// Start every configured process in dependency order.
    ///
    /// Each scan over the not-yet-started processes starts those whose
    /// dependencies are all running. A failed start, or a scan that starts
    /// nothing, stops everything this call started (in reverse) and
    /// returns the error. A shutdown requested mid-startup is honoured
    /// before the next launch.
    pub async fn start_all(&self) -> SupervisorResult<()> {
        self.ensure_open()?;
        if self.settings.reclaim_orphans_on_start {
            self.reclaim_orphans().await;
        }

        let mut tracked = self.tracked.lock().await;
        let mut pending: Vec<&str> = self
            .processes
            .keys()
            .map(String::as_str)
            .filter(|name| position(&tracked, name).is_none())
            .collect();
        let mut started: Vec<String> = Vec::new();

        while !pending.is_empty() {
            let started_before = started.len();
            let mut waiting = Vec::new();
            for name in pending {
                if !self.dependencies_running(&tracked, name) {
                    waiting.push(name);
                    continue;
                }
                if self.is_shut_down() {
                    info!(process = %name, "shutdown requested during startup, rolling back");
                    self.rollback(&mut tracked, &started).await;
                    return Err(SupervisorError::ShutDown);
                }
                match self.launch(name, 0).await {
                    Ok(process) => {
                        tracked.push(process);
                        started.push(name.to_string());
                    }
                    Err(e) => {
                        error!(process = %name, error = %e, "startup failed, rolling back");
                        self.rollback(&mut tracked, &started).await;
                        return Err(e);
                    }
                }
            }
            if !waiting.is_empty() && started.len() == started_before {
                let err = self.dependency_error(&tracked, &waiting);
                error!(error = %err, "startup blocked on dependencies, rolling back");
                self.rollback(&mut tracked, &started).await;
                return Err(err);
            }
            pending = waiting;
        }

        info!(started = started.len(), "all processes started");
        Ok(())
    }

    /// Start one process. Its dependencies must already be running.
    /// Starting a process that is already running is a no-op.
    pub async fn start_process(&self, name: &str) -> SupervisorResult<()> {
        self.ensure_open()?;
        let config = self.config_of(name)?;

        let mut tracked = self.tracked.lock().await;
        if let Some(index) = position(&tracked, name) {
            if !tracked[index].handle.has_exited() {
                return Ok(());
            }
            self.stop_entry(&mut tracked, index).await;
        }
        for dependency in &config.depends_on {
            if !is_running(&tracked, dependency) {
                return Err(SupervisorError::DependencyNotRunning {
                    process: name.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        let process = self.launch(name, 0).await?;
        tracked.push(process);
        Ok(())
    }

    /// Stop one process. Returns `false` if it was not running.
    pub async fn stop(&self, name: &str) -> bool {
        let mut tracked = self.tracked.lock().await;
        match position(&tracked, name) {
            Some(index) => {
                self.stop_entry(&mut tracked, index).await;
                true
            }
            None => false,
        }
    }

    /// Stop (if running) and start `name` again from its configuration.
    pub async fn restart(&self, name: &str) -> SupervisorResult<()> {
        self.ensure_open()?;
        self.config_of(name)?;
        let mut tracked = self.tracked.lock().await;
        self.restart_entry(&mut tracked, name).await
    }

    /// Stop every tracked process, dependents first. Only the first call
    /// acts; returns the number of processes stopped.
    pub async fn shutdown_all(&self) -> usize {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        info!("shutting down all processes");
        self.reclaim_orphans().await;

        let mut tracked = self.tracked.lock().await;
        let mut stopped = 0;
        while let Some(last) = tracked.len().checked_sub(1) {
            self.stop_entry(&mut tracked, last).await;
            stopped += 1;
        }
        info!(stopped, "all processes stopped");
        stopped
    }

    /// Terminate leftover processes matching the orphan patterns, sparing
    /// everything this supervisor tracks.
    pub async fn reclaim_orphans(&self) -> usize {
        if self.orphans.is_empty() {
            return 0;
        }
        let exclusions = {
            let tracked = self.tracked.lock().await;
            Exclusions::for_tracked(tracked.iter().filter_map(|p| p.handle.pid()))
        };
        let reclaimed = self.orphans.reclaim(&exclusions).await;
        if reclaimed > 0 {
            info!(reclaimed, "orphaned processes reclaimed");
        }
        reclaimed
    }

    /// One monitoring pass.
    ///
    /// Dead processes restart under `on-failure` and `always` and are
    /// dropped under `never`. Alive processes failing their health check
    /// restart only under `always`. Each process restarts at most once per
    /// pass.
    pub async fn monitor_once(&self) -> MonitorReport {
        let mut report = MonitorReport::default();
        if self.is_shut_down() {
            return report;
        }

        let checks: Vec<_> = {
            let mut tracked = self.tracked.lock().await;
            tracked
                .iter_mut()
                .filter_map(|p| {
                    if p.handle.has_exited() {
                        return None;
                    }
                    let spec = p.config.health_check.clone()?;
                    Some((p.name.clone(), spec))
                })
                .collect()
        };

        let mut probes = JoinSet::new();
        for (name, spec) in checks {
            let probe = Arc::clone(&self.probe);
            probes.spawn(async move { (name, probe.probe(&spec).await) });
        }
        let mut health = HashMap::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((name, healthy)) => {
                    health.insert(name, healthy);
                }
                Err(e) => warn!(error = %e, "health probe task failed"),
            }
        }

        let mut tracked = self.tracked.lock().await;
        if self.is_shut_down() {
            return report;
        }
        let mut to_restart = Vec::new();
        let mut index = 0;
        while index < tracked.len() {
            let process = &mut tracked[index];
            let name = process.name.clone();
            let policy = process.config.restart_policy;

            if process.handle.has_exited() {
                if policy.restarts_on_exit() {
                    warn!(process = %name, %policy, "process died, restarting");
                    to_restart.push(name);
                    index += 1;
                } else {
                    warn!(process = %name, %policy, "process died, no longer tracked");
                    self.stop_entry(&mut tracked, index).await;
                    report.dropped.push(name);
                }
                continue;
            }

            if let Some(&healthy) = health.get(&name) {
                process.healthy = Some(healthy);
                if healthy {
                    process.state = ProcessState::Running;
                } else if policy.restarts_on_unhealthy() {
                    warn!(process = %name, "process unhealthy, restarting");
                    to_restart.push(name);
                } else {
                    warn!(process = %name, %policy, "process unhealthy");
                    process.state = ProcessState::Unhealthy;
                    report.unhealthy.push(name);
                }
            }
            index += 1;
        }

        for name in to_restart {
            match self.restart_entry(&mut tracked, &name).await {
                Ok(()) => report.restarted.push(name),
                Err(e) => {
                    error!(process = %name, error = %e, "restart failed");
                    report.failed.push(name);
                }
            }
        }
        report
    }

    /// Run monitoring passes every `health_check_interval` until
    /// `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.settings.health_check_interval;
        info!(interval_ms = interval.as_millis() as u64, "supervisor monitoring started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.monitor_once().await;
                    if !report.is_quiet() {
                        info!(
                            restarted = report.restarted.len(),
                            dropped = report.dropped.len(),
                            unhealthy = report.unhealthy.len(),
                            failed = report.failed.len(),
                            "monitor pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("supervisor monitoring stopping");
                    break;
                }
            }
        }
    }

    /// Every configured process, tracked or not, in name order.
    pub async fn status(&self) -> Vec<ProcessStatus> {
        let tracked = self.tracked.lock().await;
        self.processes
            .iter()
            .map(|(name, config)| match position(&tracked, name) {
                Some(index) => tracked[index].status(),
                None => ProcessStatus::stopped(name, config),
            })
            .collect()
    }

    fn dependencies_running(&self, tracked: &[ManagedProcess], name: &str) -> bool {
        self.processes
            .get(name)
            .is_some_and(|config| config.depends_on.iter().all(|d| is_running(tracked, d)))
    }

    /// Why none of `waiting` could start: a dependency that is not
    /// configured, one that is configured but not running and not
    /// startable, or a cycle among the waiting processes.
    fn dependency_error(&self, tracked: &[ManagedProcess], waiting: &[&str]) -> SupervisorError {
        for &name in waiting {
            let Some(config) = self.processes.get(name) else {
                return SupervisorError::UnknownProcess(name.to_string());
            };
            for dependency in &config.depends_on {
                if !self.processes.contains_key(dependency) {
                    return SupervisorError::DependencyMissing {
                        process: name.to_string(),
                        dependency: dependency.clone(),
                    };
                }
                if !waiting.contains(&dependency.as_str()) && !is_running(tracked, dependency) {
                    return SupervisorError::DependencyNotRunning {
                        process: name.to_string(),
                        dependency: dependency.clone(),
                    };
                }
            }
        }
        SupervisorError::DependencyCycle {
            pending: waiting.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Spawn `name`, honour its startup delay and run its health check,
    /// all within the startup timeout.
    async fn launch(&self, name: &str, restart_count: u32) -> SupervisorResult<ManagedProcess> {
        let config = self.config_of(name)?;
        info!(process = %name, command = ?config.command, "starting process");

        let log_dir = log_dir(&self.settings.log_directory);
        let mut handle = ProcessHandle::spawn(name, config, log_dir)?;
        let started_at = Instant::now();

        let timeout = self.settings.startup_timeout;
        let ready = tokio::time::timeout(timeout, async {
            if !config.startup_delay.is_zero() {
                tokio::time::sleep(config.startup_delay).await;
            }
            if handle.has_exited() {
                return Err(SupervisorError::ExitedDuringStartup {
                    process: name.to_string(),
                });
            }
            if !self.probe.check(config.health_check.as_ref()).await {
                return Err(SupervisorError::HealthCheckFailed {
                    process: name.to_string(),
                });
            }
            Ok(())
        })
        .await
        .unwrap_or_else(|_| {
            Err(SupervisorError::StartupTimeout {
                process: name.to_string(),
                timeout,
            })
        });

        if let Err(e) = ready {
            handle.stop(self.settings.shutdown_timeout).await;
            return Err(e);
        }

        info!(process = %name, pid = handle.pid(), restart_count, "process started");
        Ok(ManagedProcess {
            name: name.to_string(),
            config: config.clone(),
            handle,
            state: ProcessState::Running,
            started_at,
            restart_count,
            healthy: config.health_check.as_ref().map(|_| true),
        })
    }

    async fn restart_entry(
        &self,
        tracked: &mut Vec<ManagedProcess>,
        name: &str,
    ) -> SupervisorResult<()> {
        let (index, restart_count) = match position(tracked, name) {
            Some(index) => {
                let restart_count = tracked[index].restart_count.saturating_add(1);
                tracked[index].state = ProcessState::Restarting;
                self.stop_entry(tracked, index).await;
                (index, restart_count)
            }
            None => (tracked.len(), 0),
        };
        let process = self.launch(name, restart_count).await?;
        tracked.insert(index.min(tracked.len()), process);
        Ok(())
    }

    async fn rollback(&self, tracked: &mut Vec<ManagedProcess>, started: &[String]) {
        for name in started.iter().rev() {
            if let Some(index) = position(tracked, name) {
                self.stop_entry(tracked, index).await;
            }
        }
    }

    /// Stop the process at `index` and remove it once it is gone.
    async fn stop_entry(&self, tracked: &mut Vec<ManagedProcess>, index: usize) -> StopOutcome {
        let outcome = tracked[index]
            .handle
            .stop(self.settings.shutdown_timeout)
            .await;
        let process = tracked.remove(index);
        info!(process = %process.name, pid = process.handle.pid(), ?outcome, "process stopped");
        outcome
    }
}

fn position(tracked: &[ManagedProcess], name: &str) -> Option<usize> {
    tracked.iter().position(|p| p.name == name)
}

fn is_running(tracked: &[ManagedProcess], name: &str) -> bool {
    tracked
        .iter()
        .any(|p| p.name == name && p.state == ProcessState::Running)
}

fn log_dir(dir: &Path) -> Option<&Path> {
    (!dir.as_os_str().is_empty()).then_some(dir)
}
