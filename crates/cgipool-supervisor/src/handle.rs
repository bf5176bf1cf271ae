//! OS handle of one supervised process.
//!
//! Every process is the leader of its own process group, so stopping it
//! reaches whatever it forked (an interpreter, a build tool, a server's
//! worker children). The handle owns the `Child`; dropping it kills the
//! leader.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use cgipool_core::ProcessConfig;
use cgipool_core::signal::{self, Signal};

use crate::error::{SupervisorError, SupervisorResult};

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Already gone before we signalled it.
    AlreadyExited,
    /// Exited after SIGTERM within the timeout.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

impl ProcessHandle {
    /// Launch `config` as `name` in a new process group. Output is appended
    /// to `<log_dir>/<name>.log` when a log directory is given.
    pub fn spawn(
        name: &str,
        config: &ProcessConfig,
        log_dir: Option<&Path>,
    ) -> SupervisorResult<Self> {
        let Some((program, args)) = config.command.split_first() else {
            return Err(SupervisorError::Spawn {
                process: name.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        let (stdout, stderr) = log_output(name, log_dir);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&config.cwd)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .process_group(0);

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            process: name.to_string(),
            source,
        })?;
        let pid = child.id();
        Ok(Self { child, pid })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check. Errors reading the status count as exited.
    pub fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM the group, wait up to `timeout`, then SIGKILL the group and
    /// wait for the leader unconditionally. Returns once the leader is gone.
    pub async fn stop(&mut self, timeout: Duration) -> StopOutcome {
        if self.has_exited() {
            self.signal_group(Signal::SIGKILL);
            return StopOutcome::AlreadyExited;
        }

        self.signal_group(Signal::SIGTERM);
        if tokio::time::timeout(timeout, self.child.wait()).await.is_ok() {
            // Leader is gone; take down any stragglers left in its group.
            self.signal_group(Signal::SIGKILL);
            return StopOutcome::Terminated;
        }

        warn!(pid = self.pid, ?timeout, "process ignored SIGTERM, killing group");
        self.signal_group(Signal::SIGKILL);
        if let Err(e) = self.child.kill().await {
            debug!(pid = self.pid, error = %e, "kill after group SIGKILL failed");
        }
        StopOutcome::Killed
    }

    fn signal_group(&self, sig: Signal) {
        let Some(pid) = self.pid else { return };
        match signal::signal_group(pid, sig) {
            Ok(()) | Err(signal::Errno::ESRCH) => {}
            Err(e) => debug!(pid, signal = ?sig, error = %e, "group signal failed"),
        }
    }
}

fn log_output(name: &str, log_dir: Option<&Path>) -> (Stdio, Stdio) {
    let Some(dir) = log_dir else {
        return (Stdio::null(), Stdio::null());
    };
    let path = dir.join(format!("{name}.log"));
    let opened = std::fs::create_dir_all(dir)
        .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
        .and_then(|file| Ok((file.try_clone()?, file)));
    match opened {
        Ok((out, err)) => (Stdio::from(out), Stdio::from(err)),
        Err(e) => {
            warn!(process = %name, path = %path.display(), error = %e, "cannot open process log, discarding output");
            (Stdio::null(), Stdio::null())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_terminates_cooperative_process() {
        let config = ProcessConfig::new(["sleep", "30"]);
        let mut handle = ProcessHandle::spawn("sleeper", &config, None).unwrap();
        let pid = handle.pid().unwrap();

        assert_eq!(handle.stop(Duration::from_secs(2)).await, StopOutcome::Terminated);
        assert!(!signal::is_alive(pid));
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let config = ProcessConfig::new(["sh", "-c", "trap '' TERM; sleep 30"]);
        let mut handle = ProcessHandle::spawn("stubborn", &config, None).unwrap();
        let pid = handle.pid().unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handle.stop(Duration::from_millis(200)).await, StopOutcome::Killed);
        assert!(!signal::is_alive(pid));
    }

    #[tokio::test]
    async fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let config = ProcessConfig::new(["sh", "-c", "echo \"$GREETING from $(pwd -P)\""])
            .cwd(dir.path())
            .env("GREETING", "hello");
        let mut handle = ProcessHandle::spawn("greeter", &config, Some(&logs)).unwrap();
        for _ in 0..100 {
            if handle.has_exited() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let log = std::fs::read_to_string(logs.join("greeter.log")).unwrap();
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(log.trim(), format!("hello from {}", expected_dir.display()));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let config = ProcessConfig::new(["/nonexistent/daemon"]);
        let err = ProcessHandle::spawn("ghost", &config, None).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { ref process, .. } if process == "ghost"));
    }
}
