//! In-memory launcher for pool and registry tests, plus process helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cgipool_core::CommandTemplate;

use crate::error::{PoolError, PoolResult};
use crate::launcher::{WorkerHandle, WorkerLauncher};

/// Observable state of one fake worker.
#[derive(Debug, Default)]
pub struct FakeProcess {
    pub exited: AtomicBool,
    pub terminated: AtomicBool,
}

#[derive(Debug)]
struct FakeHandle {
    pid: u32,
    process: Arc<FakeProcess>,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.process.exited.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) {
        self.process.terminated.store(true, Ordering::SeqCst);
    }
}

/// Records every launch; can be told to fail.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    fail: AtomicBool,
    launches: AtomicUsize,
    processes: Mutex<HashMap<u16, Arc<FakeProcess>>>,
    ports: Mutex<Vec<u16>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Ports handed to `launch`, in call order.
    pub fn ports(&self) -> Vec<u16> {
        self.ports.lock().unwrap().clone()
    }

    pub fn process(&self, port: u16) -> Arc<FakeProcess> {
        self.processes.lock().unwrap()[&port].clone()
    }

    pub fn terminated(&self, port: u16) -> bool {
        self.process(port).terminated.load(Ordering::SeqCst)
    }

    pub fn kill(&self, port: u16) {
        self.process(port).exited.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(
        &self,
        _service: &str,
        command: &CommandTemplate,
        port: u16,
    ) -> PoolResult<Box<dyn WorkerHandle>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.ports.lock().unwrap().push(port);
        if self.fail.load(Ordering::SeqCst) {
            return Err(PoolError::Launch {
                command: command.display_for_port(port),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }
        let process = Arc::new(FakeProcess::default());
        self.processes.lock().unwrap().insert(port, process.clone());
        Ok(Box::new(FakeHandle {
            pid: 10_000 + u32::from(port),
            process,
        }))
    }
}

/// Whether `pid` is alive and not a zombie awaiting its reap.
pub fn running(pid: u32) -> bool {
    let Ok(output) = std::process::Command::new("ps")
        .args(["-o", "stat=", "-p", &pid.to_string()])
        .output()
    else {
        return false;
    };
    let stat = String::from_utf8_lossy(&output.stdout);
    let stat = stat.trim();
    !stat.is_empty() && !stat.starts_with('Z')
}
