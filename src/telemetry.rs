//! Backend self-report polling (`GET /info`)
//!
//! Backends may expose `GET /info` returning `{"connections": n, "cpu":
//! f}` as JSON. When a polling interval is configured, the poller fetches
//! each backend on that cadence and keeps the latest snapshot. Backend
//! selection does not consume these reports; the snapshot is held for
//! operators and future selection strategies.

use crate::backend::BackendRegistry;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::StatusCode;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One backend's self-reported state.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ServerInfo {
    pub connections: u64,
    pub cpu: f64,
}

/// Latest `/info` report per backend, `None` until a backend has
/// answered at least once (or after a failed poll).
#[derive(Debug, Default)]
pub struct InfoSnapshots {
    reports: RwLock<Vec<Option<ServerInfo>>>,
}

impl InfoSnapshots {
    pub fn new(backend_count: usize) -> Self {
        Self {
            reports: RwLock::new(vec![None; backend_count]),
        }
    }

    pub fn get(&self) -> Vec<Option<ServerInfo>> {
        self.reports.read().clone()
    }

    fn store(&self, reports: Vec<Option<ServerInfo>>) {
        *self.reports.write() = reports;
    }
}

/// Periodically polls every backend's `/info` endpoint.
pub struct InfoPoller {
    client: Client<HttpConnector, Empty<Bytes>>,
    registry: Arc<BackendRegistry>,
    snapshots: Arc<InfoSnapshots>,
    interval: Duration,
}

impl InfoPoller {
    pub fn new(registry: Arc<BackendRegistry>, interval: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        let snapshots = Arc::new(InfoSnapshots::new(registry.endpoints().len()));

        Self {
            client,
            registry,
            snapshots,
            interval,
        }
    }

    pub fn snapshots(&self) -> Arc<InfoSnapshots> {
        Arc::clone(&self.snapshots)
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "Backend info poller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.poll_all().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Backend info poller shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn poll_all(&self) {
        let mut reports = Vec::with_capacity(self.registry.endpoints().len());
        for server in self.registry.endpoints() {
            let report = match self.fetch_info(&server.host).await {
                Ok(info) => {
                    debug!(backend = %server.host, connections = info.connections, cpu = info.cpu, "info report");
                    Some(info)
                }
                Err(e) => {
                    warn!(backend = %server.host, error = %e, "info poll failed");
                    None
                }
            };
            reports.push(report);
        }
        self.snapshots.store(reports);
    }

    async fn fetch_info(&self, host: &str) -> anyhow::Result<ServerInfo> {
        let uri = format!("http://{host}/info");
        let req = hyper::Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Empty::<Bytes>::new())?;

        let response = self.client.request(req).await?;

        if response.status() != StatusCode::OK {
            anyhow::bail!("GET {uri}: status code {}", response.status());
        }
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.split(';').next() == Some("application/json"));
        if !is_json {
            anyhow::bail!("GET {uri}: Content-Type isn't application/json");
        }

        let body = response.into_body().collect().await?.to_bytes();
        let info: ServerInfo = serde_json::from_slice(&body)?;
        Ok(info)
    }
}
