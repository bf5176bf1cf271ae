//! cgipool-pool — elastic pools of CGI worker processes.
//!
//! Each service gets a [`WorkerPool`]: a set of identical worker processes,
//! one per port, kept between a configured minimum and maximum. The
//! [`PoolRegistry`] owns every pool and drives the periodic cycle.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry
//!   ├── WorkerPool per service (Mutex<PoolState>)
//!   │   ├── WorkerLauncher → Box<dyn WorkerHandle> (one OS process group)
//!   │   └── HealthProbe (verify after spawn, periodic health query)
//!   └── UpstreamFile (healthy endpoints, fully rewritten every cycle)
//! ```
//!
//! # Cycle
//!
//! Every interval, per pool: `health_check` (evict dead or failing
//! workers) → `ensure_minimum` (bounded respawn) → `scale_up` (one extra
//! worker under load) → republish the upstream file.

pub mod error;
pub mod launcher;
pub mod pool;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod upstream;
pub mod worker;

pub use error::{PoolError, PoolResult};
pub use launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use pool::{PoolStatus, SCALE_UP_THRESHOLD, WorkerPool};
pub use registry::{CycleReport, DEFAULT_CYCLE_INTERVAL, PoolRegistry};
pub use upstream::{
    DEFAULT_UPSTREAM_PATH, Endpoint, PublishReport, UpstreamFile, render_upstreams,
};
pub use worker::{WorkerProcess, WorkerStatus};
