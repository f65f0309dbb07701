//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)

use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use onionbox_buffer::{DestroyReason, SweepReport};
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

type Labels = Vec<(String, String)>;

/// Package lifecycle counters shared by the HTTP handlers and the sweeper.
#[derive(Clone, Default)]
pub struct Metrics {
    pub uploads: Counter,
    pub downloads: Family<Labels, Counter>,
    pub destroyed: Family<Labels, Counter>,
    pub live: Gauge,
}

impl Metrics {
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "onionbox_uploads",
            "Packages stored",
            metrics.uploads.clone(),
        );
        registry.register(
            "onionbox_downloads",
            "Download attempts by outcome",
            metrics.downloads.clone(),
        );
        registry.register(
            "onionbox_buffers_destroyed",
            "Buffers destroyed by reason",
            metrics.destroyed.clone(),
        );
        registry.register(
            "onionbox_buffers_live",
            "Packages currently held in memory",
            metrics.live.clone(),
        );
        metrics
    }

    pub fn record_download(&self, outcome: &str) {
        self.downloads
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    pub fn record_destroyed(&self, reason: DestroyReason, count: u64) {
        if count == 0 {
            return;
        }
        self.destroyed
            .get_or_create(&vec![("reason".to_string(), reason.as_str().to_string())])
            .inc_by(count);
    }

    pub fn record_sweep(&self, report: &SweepReport) {
        self.record_destroyed(DestroyReason::Expired, report.expired as u64);
        self.record_destroyed(DestroyReason::LimitReached, report.exhausted as u64);
    }

    pub fn set_live(&self, count: usize) {
        self.live.set(count as i64);
    }
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, registry: Arc<Registry>) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
