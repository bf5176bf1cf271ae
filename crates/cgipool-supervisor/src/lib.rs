//! cgipool-supervisor — long-lived infrastructure processes.
//!
//! The [`Supervisor`] owns a small set of named, heterogeneous processes
//! (the pool daemon, a reverse proxy) with explicit dependency edges.
//!
//! # Architecture
//!
//! ```text
//! Supervisor
//!   ├── tracked: Mutex<Vec<ManagedProcess>>   (start order)
//!   │   └── ProcessHandle (own process group, kill_on_drop)
//!   ├── HealthProbe                            (startup + periodic checks)
//!   └── OrphanScanner                          (sysinfo + regex patterns)
//! ```
//!
//! # Lifecycle
//!
//! `start_all` → repeated scans, starting processes whose dependencies
//! run → `run` loop (`monitor_once` every interval, restarts per policy)
//! → `shutdown_all` (orphans first, then tracked processes in reverse).

pub mod error;
pub mod handle;
pub mod managed;
pub mod orphan;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use handle::{ProcessHandle, StopOutcome};
pub use managed::{ProcessState, ProcessStatus};
pub use orphan::{Exclusions, Orphan, OrphanScanner};
pub use supervisor::{MonitorReport, Supervisor};
