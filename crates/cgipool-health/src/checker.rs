//! Probe implementations.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use tokio::net::TcpStream;
use tracing::debug;

use cgipool_core::{HealthCheckKind, HealthCheckSpec};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The target answered as expected.
    Healthy,
    /// The target answered, but not as expected (non-200, non-zero exit).
    Unhealthy,
    /// The probe could not be executed (connection error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

/// Anything that can answer "is this spec healthy right now?".
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Run one probe. Must not panic or error; failures read as `false`.
    async fn probe(&self, spec: &HealthCheckSpec) -> bool;

    /// Like [`probe`](Self::probe), but no configured check is a pass.
    async fn check(&self, spec: Option<&HealthCheckSpec>) -> bool {
        match spec {
            Some(spec) => self.probe(spec).await,
            None => true,
        }
    }
}

/// The production probe: real sockets, real HTTP, real shell commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthChecker;

impl HealthChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthProbe for HealthChecker {
    async fn probe(&self, spec: &HealthCheckSpec) -> bool {
        probe(spec, spec.timeout).await.is_healthy()
    }
}

/// Run `spec` within `timeout`.
pub async fn probe(spec: &HealthCheckSpec, timeout: Duration) -> ProbeResult {
    let result = match spec.kind {
        HealthCheckKind::Port => port_probe(&spec.target, timeout).await,
        HealthCheckKind::Http => http_probe(&spec.target, timeout).await,
        HealthCheckKind::Command => command_probe(&spec.target, timeout).await,
    };
    debug!(kind = %spec.kind, target = %spec.target, ?result, "health probe");
    result
}

/// TCP connect to `localhost:<port>`.
async fn port_probe(target: &str, timeout: Duration) -> ProbeResult {
    let port: u16 = match target.trim().parse() {
        Ok(port) => port,
        Err(_) => {
            debug!(%target, "port probe target is not a port");
            return ProbeResult::Failed;
        }
    };

    match tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(port, error = %e, "port probe connection failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(port, "port probe timed out");
            ProbeResult::Failed
        }
    }
}

/// `GET <url>` over HTTP/1.1; healthy only on 200.
async fn http_probe(url: &str, timeout: Duration) -> ProbeResult {
    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            debug!(%url, error = %e, "health probe url is invalid");
            return ProbeResult::Failed;
        }
    };
    if uri.scheme_str().is_some_and(|s| s != "http") {
        debug!(%url, "health probe only speaks plain http");
        return ProbeResult::Failed;
    }
    let Some(host) = uri.host().map(str::to_string) else {
        debug!(%url, "health probe url has no host");
        return ProbeResult::Failed;
    };
    let port = uri.port_u16().unwrap_or(80);
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| host.clone());
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let result = tokio::time::timeout(timeout, async {
        let stream = match TcpStream::connect((host.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %url, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %url, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match Request::builder()
            .method("GET")
            .uri(path.as_str())
            .header("host", authority.as_str())
            .header("user-agent", "cgipool-health/0.1")
            .body(Empty::<Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %url, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status() == StatusCode::OK => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %url, "health probe non-200");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %url, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    match result {
        Ok(probe) => probe,
        Err(_) => {
            debug!(%url, "health probe timed out");
            ProbeResult::Failed
        }
    }
}

/// `sh -c <command>`; healthy on exit code 0. The child is killed if the
/// timeout elapses.
async fn command_probe(command: &str, timeout: Duration) -> ProbeResult {
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(%command, error = %e, "command probe failed to spawn");
            return ProbeResult::Failed;
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%command, ?status, "command probe exited non-zero");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(%command, error = %e, "command probe wait failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%command, "command probe timed out");
            let _ = child.start_kill();
            ProbeResult::Failed
        }
    }
}
