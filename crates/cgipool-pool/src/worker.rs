//! A single tracked worker.

use std::time::{Duration, Instant};

use crate::launcher::WorkerHandle;

/// One worker process owned by a pool, keyed by its port.
#[derive(Debug)]
pub struct WorkerProcess {
    port: u16,
    handle: Box<dyn WorkerHandle>,
    spawned_at: Instant,
    healthy: bool,
    request_count: u64,
}

impl WorkerProcess {
    /// A freshly verified worker. Workers only enter a pool once verified,
    /// so they start out healthy.
    pub(crate) fn new(port: u16, handle: Box<dyn WorkerHandle>) -> Self {
        Self {
            port,
            handle,
            spawned_at: Instant::now(),
            healthy: true,
            request_count: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    pub(crate) fn has_exited(&mut self) -> bool {
        self.handle.has_exited()
    }

    pub(crate) fn set_healthy(&mut self, healthy: bool) {
        self.healthy = healthy;
    }

    pub(crate) fn add_requests(&mut self, count: u64) {
        self.request_count = self.request_count.saturating_add(count);
    }

    /// Stop the OS process and wait until it is gone.
    pub(crate) async fn terminate(mut self) {
        self.handle.terminate().await;
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        WorkerStatus {
            port: self.port,
            pid: self.pid(),
            healthy: self.healthy,
            request_count: self.request_count,
            uptime: self.uptime(),
        }
    }
}

/// Read-only view of a worker, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub port: u16,
    pub pid: Option<u32>,
    pub healthy: bool,
    pub request_count: u64,
    pub uptime: Duration,
}
