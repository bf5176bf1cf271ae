//! Supervise mode — the long-lived process supervisor.
//!
//! Nothing persists between invocations, so actions that address processes
//! from an earlier run (`stop`, `status`, `cleanup`) find them in the OS
//! process table by command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use tokio::sync::watch;
use tracing::{info, warn};

use cgipool_core::{ProcessConfig, SupervisorConfig};
use cgipool_health::HealthChecker;
use cgipool_supervisor::{Exclusions, Orphan, OrphanScanner, Supervisor};

use crate::shutdown::ShutdownSignals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Start processes in dependency order and keep them running.
    Start,
    /// Stop processes left running by an earlier invocation.
    Stop,
    /// Stop leftovers, then start.
    Restart,
    /// Show configured processes and any live instances.
    Status,
    /// Like `start`, logging a status line for every process on each pass.
    Monitor,
    /// Terminate processes matching the orphan patterns.
    Cleanup,
    /// Write a starter configuration file.
    InitConfig,
}

pub async fn run(
    action: Action,
    process: Option<String>,
    config_path: PathBuf,
    monitor_interval: Option<Duration>,
) -> anyhow::Result<()> {
    if action == Action::InitConfig {
        return init_config(&config_path);
    }

    let mut config = SupervisorConfig::from_file(&config_path)
        .with_context(|| format!("loading supervisor config {}", config_path.display()))?;
    if let Some(interval) = monitor_interval {
        config.global_settings.health_check_interval = interval;
    }
    if let Some(name) = &process {
        anyhow::ensure!(
            config.processes.contains_key(name),
            "unknown process `{name}` in {}",
            config_path.display()
        );
    }

    match action {
        Action::Start => supervise(config, process.as_deref(), false).await,
        Action::Monitor => supervise(config, process.as_deref(), true).await,
        Action::Restart => {
            let stopped = stop_running(&config, process.as_deref()).await?;
            info!(stopped, "previous instances stopped");
            supervise(config, process.as_deref(), false).await
        }
        Action::Stop => {
            let stopped = stop_running(&config, process.as_deref()).await?;
            println!("stopped {stopped} process(es)");
            Ok(())
        }
        Action::Cleanup => {
            let scanner = OrphanScanner::new(&config.global_settings.orphan_patterns)?;
            let reclaimed = scanner.reclaim(&Exclusions::current_process()).await;
            println!("reclaimed {reclaimed} orphaned process(es)");
            Ok(())
        }
        Action::Status => {
            print_status(&config, process.as_deref())?;
            Ok(())
        }
        Action::InitConfig => init_config(&config_path),
    }
}

fn init_config(path: &Path) -> anyhow::Result<()> {
    anyhow::ensure!(
        !path.exists(),
        "{} already exists; remove it first",
        path.display()
    );
    SupervisorConfig::scaffold()
        .write_to(path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Start everything (or one process), monitor until a shutdown signal, then
/// stop everything.
async fn supervise(
    config: SupervisorConfig,
    only: Option<&str>,
    report_status: bool,
) -> anyhow::Result<()> {
    info!(processes = config.processes.len(), "cgipool daemon starting in supervise mode");
    let signals = ShutdownSignals::install().context("installing signal handlers")?;
    let supervisor = Arc::new(Supervisor::new(config, Arc::new(HealthChecker::new()))?);

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let signal_handle = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            signals.recv().await;
            let _ = shutdown_tx.send(true);
            supervisor.shutdown_all().await;
        })
    };

    // ── Startup ────────────────────────────────────────────────
    let started = match only {
        Some(name) => supervisor.start_process(name).await,
        None => supervisor.start_all().await,
    };
    if let Err(e) = started {
        if !supervisor.is_shut_down() {
            supervisor.shutdown_all().await;
            return Err(e).context("startup failed");
        }
    }

    // ── Monitoring ─────────────────────────────────────────────
    let monitor_handle = {
        let supervisor = Arc::clone(&supervisor);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { supervisor.run(shutdown_rx).await })
    };
    if report_status {
        let interval = supervisor.settings().health_check_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => log_status(&supervisor).await,
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    let _ = monitor_handle.await;
    let _ = signal_handle.await;
    info!("cgipool daemon stopped");
    Ok(())
}

async fn log_status(supervisor: &Supervisor) {
    for status in supervisor.status().await {
        info!(
            process = %status.name,
            state = %status.state,
            pid = status.pid,
            uptime_secs = status.uptime.map(|u| u.as_secs()),
            restarts = status.restart_count,
            healthy = status.healthy,
            "process status"
        );
    }
}

/// Scanner matching the exact command lines of the selected processes.
fn instance_scanner(
    config: &SupervisorConfig,
    only: Option<&str>,
) -> anyhow::Result<OrphanScanner> {
    let patterns: Vec<String> = selected(config, only)
        .map(|(_, process)| command_pattern(process))
        .collect();
    Ok(OrphanScanner::new(&patterns)?)
}

fn selected<'a>(
    config: &'a SupervisorConfig,
    only: Option<&'a str>,
) -> impl Iterator<Item = (&'a String, &'a ProcessConfig)> {
    config
        .processes
        .iter()
        .filter(move |(name, _)| only.is_none_or(|only| only == name.as_str()))
}

fn command_pattern(process: &ProcessConfig) -> String {
    format!("^{}$", regex::escape(&process.command.join(" ")))
}

async fn stop_running(config: &SupervisorConfig, only: Option<&str>) -> anyhow::Result<usize> {
    let scanner = instance_scanner(config, only)?;
    Ok(scanner.reclaim(&Exclusions::current_process()).await)
}

fn print_status(config: &SupervisorConfig, only: Option<&str>) -> anyhow::Result<()> {
    let exclusions = Exclusions::current_process();
    for (name, process) in selected(config, only) {
        let scanner = OrphanScanner::new(&[command_pattern(process)])?;
        let running: Vec<Orphan> = scanner.find(&exclusions);
        let state = if running.is_empty() {
            "stopped".to_string()
        } else {
            let pids: Vec<String> = running.iter().map(|o| o.pid.to_string()).collect();
            format!("running (pid {})", pids.join(", "))
        };
        let deps = if process.depends_on.is_empty() {
            "-".to_string()
        } else {
            process.depends_on.join(",")
        };
        println!(
            "{name:<20} {state:<28} policy={:<10} depends_on={deps}",
            process.restart_policy.to_string()
        );
    }

    let orphans = OrphanScanner::new(&config.global_settings.orphan_patterns)?;
    let leftovers = orphans.find(&exclusions);
    if !leftovers.is_empty() {
        warn!(count = leftovers.len(), "processes matching orphan patterns are running");
        for orphan in leftovers {
            println!("orphan {:>7} {}", orphan.pid, orphan.command);
        }
    }
    Ok(())
}
