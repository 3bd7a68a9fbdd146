use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use workerhub_core::AppConfig;
use workerhub_dispatcher::{RouteHandler, WorkerServer};
use workerhub_worker::WorkerAgent;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// What this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// The dispatcher: worker pool plus HTTP endpoints on one port.
    Serve,
    /// A single worker agent connected to a dispatcher.
    Worker,
}

pub struct Application {
    config: AppConfig,
    mode: AppMode,
}

impl Application {
    pub fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        match mode {
            AppMode::Serve => config.server.validate(),
            AppMode::Worker => config.worker.validate(),
        }
        .with_context(|| format!("invalid configuration for {mode:?} mode"))?;
        info!(mode = ?mode, "application initialized");
        Ok(Self { config, mode })
    }

    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        match self.mode {
            AppMode::Serve => self.run_serve(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
        }
    }

    async fn run_serve(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let metrics = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus recorder")?;

        let server = WorkerServer::new(self.config.server.clone());
        install_http_endpoints(&server, Some(metrics));
        let addr = server
            .start()
            .await
            .context("failed to start worker server")?;
        info!(%addr, "dispatcher listening");

        let _ = shutdown_rx.recv().await;
        info!("dispatcher shutting down");

        let timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        if !wait_for_pending_requests(&server, timeout).await {
            warn!(
                timeout_seconds = self.config.server.shutdown_timeout_seconds,
                "stopping with requests still pending"
            );
        }
        server.stop().await.context("failed to stop worker server")?;
        Ok(())
    }

    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let worker = &self.config.worker;
        let agent = WorkerAgent::from_config(worker).context("failed to create worker agent")?;
        let _ = agent.on_registered(|session_id| info!(session_id, "worker registered"));
        agent.start();

        let _ = shutdown_rx.recv().await;
        info!(worker_id = %worker.worker_id, "worker shutting down");

        let timeout = Duration::from_secs(worker.drain_timeout_seconds);
        if !agent.drain("shutdown", timeout).await {
            warn!(active = agent.tracker().active(), "disconnecting with work in flight");
        }
        agent.stop().await;
        Ok(())
    }
}

/// Registers `/health`, `/workers` and, with a recorder handle, `/metrics`
/// on the worker port.
pub fn install_http_endpoints(server: &WorkerServer, metrics: Option<PrometheusHandle>) {
    let health = server.clone();
    server.add_http_handler(RouteHandler::get("/health", move |_req: Request| {
        let workers = health.get_worker_count();
        async move { Json(json!({ "status": "ok", "workers": workers })).into_response() }
    }));

    let listing = server.clone();
    server.add_http_handler(RouteHandler::get("/workers", move |_req: Request| {
        let workers = listing.get_worker_info_list();
        async move { Json(workers).into_response() }
    }));

    if let Some(handle) = metrics {
        server.add_http_handler(RouteHandler::get("/metrics", move |_req: Request| {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    body,
                )
                    .into_response()
            }
        }));
    }
}

/// Waits until no worker has active requests. Returns `false` on timeout.
async fn wait_for_pending_requests(server: &WorkerServer, timeout: Duration) -> bool {
    let pending = || -> u32 {
        server
            .get_worker_info_list()
            .iter()
            .map(|w| w.active_requests)
            .sum()
    };

    let waited = tokio::time::timeout(timeout, async {
        loop {
            let count = pending();
            if count == 0 {
                return;
            }
            info!(pending = count, "waiting for pending requests");
            tokio::time::sleep(DRAIN_POLL).await;
        }
    })
    .await;
    waited.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;
    use workerhub_core::{ServerConfig, WorkerConfig};

    async fn get(server: &WorkerServer, path: &str) -> (StatusCode, String) {
        let response = server
            .router()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_and_workers_endpoints() {
        let server = WorkerServer::new(ServerConfig::default());
        install_http_endpoints(&server, None);

        let (status, body) = get(&server, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["workers"], 0);

        let (status, body) = get(&server, "/workers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");

        let (status, _) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_recorder() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let server = WorkerServer::new(ServerConfig::default());
        install_http_endpoints(&server, Some(recorder.handle()));

        let (status, _) = get(&server, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wait_for_pending_requests_without_workers() {
        let server = WorkerServer::new(ServerConfig::default());
        assert!(wait_for_pending_requests(&server, Duration::from_millis(10)).await);
    }

    #[test]
    fn test_worker_mode_rejects_invalid_config() {
        let config = AppConfig {
            worker: WorkerConfig {
                worker_id: String::new(),
                ..WorkerConfig::default()
            },
            ..AppConfig::default()
        };
        assert!(Application::new(config.clone(), AppMode::Worker).is_err());
        assert!(Application::new(config, AppMode::Serve).is_ok());
    }
}
