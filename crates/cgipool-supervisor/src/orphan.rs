//! Orphan reclamation.
//!
//! A previous run that crashed can leave workers or infrastructure processes
//! behind, still holding ports. The scanner walks the OS process table,
//! matches command lines against configured patterns, and terminates what
//! it finds: SIGTERM, a grace period, a re-check, then SIGKILL.
//!
//! Reclamation is advisory. Processes that vanish mid-scan or that we may
//! not signal are skipped silently.

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use sysinfo::System;
use tracing::{debug, info, warn};

use cgipool_core::signal::{self, Errno, Signal};

use crate::error::{SupervisorError, SupervisorResult};

/// Wait between SIGTERM and the SIGKILL re-check.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(1);

/// A process whose command line matched an orphan pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan {
    pub pid: u32,
    pub command: String,
}

/// Processes the scanner must never touch.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub pids: HashSet<u32>,
    /// Process groups; any member is excluded.
    pub groups: HashSet<u32>,
}

impl Exclusions {
    /// Our own pid and process group.
    pub fn current_process() -> Self {
        let own = std::process::id();
        let mut exclusions = Self::default();
        exclusions.pids.insert(own);
        if let Some(group) = signal::process_group(own) {
            exclusions.groups.insert(group);
        }
        exclusions
    }

    /// [`current_process`](Self::current_process) plus `tracked` pids and
    /// the groups they lead.
    pub fn for_tracked(tracked: impl IntoIterator<Item = u32>) -> Self {
        let mut exclusions = Self::current_process();
        for pid in tracked {
            exclusions.pids.insert(pid);
            exclusions.groups.insert(pid);
        }
        exclusions
    }

    fn excludes(&self, pid: u32) -> bool {
        if self.pids.contains(&pid) {
            return true;
        }
        signal::process_group(pid).is_some_and(|group| self.groups.contains(&group))
    }
}

#[derive(Debug, Clone)]
pub struct OrphanScanner {
    patterns: Vec<Regex>,
    grace: Duration,
}

impl OrphanScanner {
    pub fn new(patterns: &[String]) -> SupervisorResult<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| SupervisorError::Pattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<SupervisorResult<Vec<_>>>()?;
        Ok(Self {
            patterns,
            grace: ORPHAN_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, command: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(command))
    }

    /// Scan the process table for matching, non-excluded processes.
    pub fn find(&self, exclusions: &Exclusions) -> Vec<Orphan> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut system = System::new();
        system.refresh_processes();

        let mut orphans: Vec<Orphan> = system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let command = process.cmd().join(" ");
                if command.is_empty() || !self.matches(&command) {
                    return None;
                }
                Some(Orphan {
                    pid: pid.as_u32(),
                    command,
                })
            })
            .filter(|orphan| !exclusions.excludes(orphan.pid))
            .collect();
        orphans.sort_by_key(|o| o.pid);
        orphans
    }

    /// Find and terminate orphans. Returns how many were signalled.
    pub async fn reclaim(&self, exclusions: &Exclusions) -> usize {
        let orphans = self.find(exclusions);
        if orphans.is_empty() {
            debug!("no orphaned processes found");
            return 0;
        }

        let mut signalled = Vec::new();
        for orphan in &orphans {
            match signal::signal_process(orphan.pid, Signal::SIGTERM) {
                Ok(()) => {
                    info!(pid = orphan.pid, command = %orphan.command, "terminating orphaned process");
                    signalled.push(orphan.pid);
                }
                Err(Errno::ESRCH) => {}
                Err(e) => debug!(pid = orphan.pid, error = %e, "cannot signal orphan"),
            }
        }
        if signalled.is_empty() {
            return 0;
        }

        tokio::time::sleep(self.grace).await;
        for &pid in &signalled {
            if !signal::is_alive(pid) {
                continue;
            }
            warn!(pid, "orphan survived SIGTERM, killing");
            if let Err(e) = signal::signal_process(pid, Signal::SIGKILL) {
                debug!(pid, error = %e, "cannot kill orphan");
            }
        }
        signalled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn scanner(patterns: &[&str]) -> OrphanScanner {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        OrphanScanner::new(&patterns)
            .unwrap()
            .with_grace(Duration::from_millis(100))
    }

    #[test]
    fn default_patterns_match_known_commands() {
        let scanner = OrphanScanner::new(&cgipool_core::process::default_orphan_patterns()).unwrap();
        assert!(scanner.matches("./build/search.cgi 8000"));
        assert!(scanner.matches("python3 samples/sample_python_cgi.py 8001"));
        assert!(scanner.matches("dotnet-script samples/sample_csharp_cgi.csx"));
        assert!(scanner.matches("cgipoold pool --interval 5"));
        assert!(scanner.matches("dotnet run --urls=http://0.0.0.0:8080"));
        assert!(!scanner.matches("nginx: worker process"));
        assert!(!scanner.matches("cgipoold supervise start"));
    }

    #[test]
    fn bad_pattern_rejected() {
        let err = OrphanScanner::new(&["(".to_string()]).unwrap_err();
        assert!(matches!(err, SupervisorError::Pattern { .. }));
    }

    #[test]
    fn no_patterns_finds_nothing() {
        assert!(scanner(&[]).find(&Exclusions::default()).is_empty());
    }

    fn spawn_marker(seconds: &str) -> tokio::process::Child {
        Command::new("sleep")
            .arg(seconds)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn reclaims_matching_process() {
        let mut child = spawn_marker("47.123");
        let pid = child.id().unwrap();
        let scanner = scanner(&[r"^sleep 47\.123$"]);

        let found = scanner.find(&Exclusions::current_process());
        assert_eq!(found.iter().map(|o| o.pid).collect::<Vec<_>>(), vec![pid]);

        assert_eq!(scanner.reclaim(&Exclusions::current_process()).await, 1);
        tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn tracked_processes_are_skipped() {
        let mut child = spawn_marker("47.456");
        let pid = child.id().unwrap();
        let scanner = scanner(&[r"^sleep 47\.456$"]);

        assert!(scanner.find(&Exclusions::for_tracked([pid])).is_empty());
        assert_eq!(scanner.reclaim(&Exclusions::for_tracked([pid])).await, 0);
        assert!(child.try_wait().unwrap().is_none());
    }
}
