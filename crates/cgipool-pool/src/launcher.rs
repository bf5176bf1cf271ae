//! Launching worker processes.
//!
//! A [`WorkerLauncher`] turns a command template and a port into a running
//! process, represented by a [`WorkerHandle`]. The handle is the only owner
//! of the OS process. `terminate` returns only once the process group has
//! been stopped or killed; dropping a handle without terminating it still
//! kills the leader (`kill_on_drop`).

use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use cgipool_core::CommandTemplate;
use cgipool_core::signal::{self, Signal};

use crate::error::{PoolError, PoolResult};

/// Grace period between SIGTERM and SIGKILL when a worker is terminated.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Exclusive handle to one running worker process.
#[async_trait]
pub trait WorkerHandle: Send + fmt::Debug {
    /// OS process id, if the process was ever assigned one.
    fn pid(&self) -> Option<u32>;

    /// Whether the process has exited (non-blocking).
    fn has_exited(&mut self) -> bool;

    /// SIGTERM the process group, wait out the grace period, then SIGKILL
    /// the group. Returns once the leader has been reaped.
    async fn terminate(&mut self);
}

/// Starts worker processes.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        service: &str,
        command: &CommandTemplate,
        port: u16,
    ) -> PoolResult<Box<dyn WorkerHandle>>;
}

/// Launches real OS processes, each in its own process group.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// When set, worker stdout/stderr append to `<dir>/<service>-<port>.log`.
    log_dir: Option<PathBuf>,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self {
            log_dir: None,
            grace: TERMINATE_GRACE,
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn output(&self, service: &str, port: u16) -> (Stdio, Stdio) {
        let Some(dir) = &self.log_dir else {
            return (Stdio::null(), Stdio::null());
        };
        let path = dir.join(format!("{service}-{port}.log"));
        let opened = std::fs::create_dir_all(dir)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
            .and_then(|file| Ok((file.try_clone()?, file)));
        match opened {
            Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
            Err(e) => {
                warn!(%service, port, path = %path.display(), error = %e, "cannot open worker log, discarding output");
                (Stdio::null(), Stdio::null())
            }
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        service: &str,
        command: &CommandTemplate,
        port: u16,
    ) -> PoolResult<Box<dyn WorkerHandle>> {
        let (stdout, stderr) = self.output(service, port);

        let mut cmd = Command::new(&command.program);
        cmd.args(command.args_for_port(port))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| PoolError::Launch {
            command: command.display_for_port(port),
            source,
        })?;
        let pid = child.id();

        info!(%service, port, pid, "worker launched");

        Ok(Box::new(ProcessWorker {
            child,
            pid,
            grace: self.grace,
        }))
    }
}

/// A worker backed by a real child process.
#[derive(Debug)]
struct ProcessWorker {
    child: Child,
    pid: Option<u32>,
    grace: Duration,
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) {
        if self.has_exited() {
            // Leader is gone; take down anything left in its group.
            self.signal_group(Signal::SIGKILL);
            return;
        }

        self.signal_group(Signal::SIGTERM);
        if tokio::time::timeout(self.grace, self.child.wait()).await.is_ok() {
            self.signal_group(Signal::SIGKILL);
            return;
        }

        warn!(pid = self.pid, "worker ignored SIGTERM, killing");
        self.signal_group(Signal::SIGKILL);
        if let Err(e) = self.child.kill().await {
            debug!(pid = self.pid, error = %e, "kill after group SIGKILL failed");
        }
    }
}

impl ProcessWorker {
    fn signal_group(&self, sig: Signal) {
        let Some(pid) = self.pid else { return };
        match signal::signal_group(pid, sig) {
            Ok(()) | Err(signal::Errno::ESRCH) => {}
            Err(e) => debug!(pid, signal = ?sig, error = %e, "worker group signal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::running;

    #[tokio::test]
    async fn launches_and_terminates_real_process() {
        let launcher = ProcessLauncher::new().with_grace(Duration::from_millis(200));
        let command = CommandTemplate::new("sleep", vec!["{port}".to_string()]);

        // `sleep 30`: the port doubles as the sleep duration.
        let mut handle = launcher.launch("sleeper", &command, 30).await.unwrap();
        let pid = handle.pid().unwrap();
        assert!(!handle.has_exited());
        assert!(signal::is_alive(pid));

        handle.terminate().await;
        assert!(!signal::is_alive(pid), "worker {pid} still alive after terminate");
    }

    #[tokio::test]
    async fn terminate_kills_group_that_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!(
            "trap '' TERM; sleep 300 & echo $! > {}; wait",
            pid_file.display()
        );
        let launcher = ProcessLauncher::new().with_grace(Duration::from_millis(200));
        let command = CommandTemplate::new("sh", vec!["-c".to_string(), script]);

        let mut handle = launcher.launch("stubborn", &command, 8000).await.unwrap();
        let leader = handle.pid().unwrap();
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

        handle.terminate().await;
        assert!(!signal::is_alive(leader));
        let mut gone = false;
        for _ in 0..50 {
            if !running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "grandchild {grandchild} survived terminate");
    }


    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let launcher = ProcessLauncher::new();
        let command = CommandTemplate::new("/nonexistent/worker.cgi", vec![]);
        let err = launcher.launch("missing", &command, 8000).await.unwrap_err();
        assert!(matches!(err, PoolError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/worker.cgi 8000"));
    }

    #[tokio::test]
    async fn exited_process_is_detected() {
        let launcher = ProcessLauncher::new();
        let command = CommandTemplate::new("true", vec![]);
        let mut handle = launcher.launch("short", &command, 8000).await.unwrap();
        let mut exited = false;
        for _ in 0..50 {
            if handle.has_exited() {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
    }

    #[tokio::test]
    async fn output_goes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new().with_log_dir(dir.path());
        let command = CommandTemplate::new("echo", vec!["hello".to_string()]);
        let mut handle = launcher.launch("echo", &command, 8123).await.unwrap();
        for _ in 0..50 {
            if handle.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let log = std::fs::read_to_string(dir.path().join("echo-8123.log")).unwrap();
        assert_eq!(log.trim(), "hello 8123");
    }
}
