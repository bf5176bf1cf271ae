//! Shutdown signals.
//!
//! Handlers are installed up front, before any child process is spawned,
//! so a signal arriving during startup is queued rather than killing the
//! daemon with its children still running.

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::info;

pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Resolve on the first SIGINT or SIGTERM.
    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => info!("SIGINT received"),
            _ = self.terminate.recv() => info!("SIGTERM received"),
        }
    }
}
