//! cgipool-health — liveness and readiness probes.
//!
//! Three strategies, selected by [`HealthCheckKind`]:
//!
//! ```text
//! Port     TCP connect to localhost:<target>
//! Http     GET <target>, healthy on 200
//! Command  sh -c <target>, healthy on exit 0
//! ```
//!
//! Every probe is bounded by its `HealthCheckSpec` timeout and never fails
//! past its boundary: connection errors, spawn errors and timeouts all read as
//! "unhealthy". A missing spec reads as "healthy".
//!
//! Pools and the supervisor hold an `Arc<dyn HealthProbe>` so tests can
//! swap in a [`ScriptedProbe`].

pub mod checker;
pub mod scripted;

pub use cgipool_core::{HealthCheckKind, HealthCheckSpec};
pub use checker::{HealthChecker, HealthProbe, ProbeResult, probe};
pub use scripted::ScriptedProbe;
