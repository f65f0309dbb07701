//! Daemon lifecycle: startup checks, sweeper, HTTP + metrics servers, shutdown

use std::sync::Arc;

use anyhow::{Context, Result};
use onionbox_buffer::{BufferStore, DestroyReason, PinMode, PinnedRegion, StoreOptions};
use onionbox_core::config::OnionboxConfig;
use prometheus_client::registry::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::http::{self, AppState};
use crate::metrics::{self, Metrics};

pub async fn run(config: OnionboxConfig) -> Result<()> {
    info!("daemon starting");
    config.validate().context("invalid configuration")?;

    let store_options = StoreOptions::from_config(&config);
    check_pinning(store_options.pin_mode)?;

    // Start Prometheus metrics endpoint
    let mut registry = Registry::default();
    let metrics = Metrics::register(&mut registry);
    let registry = Arc::new(registry);
    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, registry).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let store = Arc::new(BufferStore::new(store_options));
    let cancel = CancellationToken::new();

    let sweeper = {
        let store = store.clone();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            store
                .run_sweeper(cancel, |report| {
                    metrics.record_sweep(report);
                    if let Some(live) = store.try_len() {
                        metrics.set_live(live);
                    }
                })
                .await
        })
    };

    let listen = config.daemon.listen.clone();
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    info!(
        listen = %listen,
        public_url = %config.daemon.public_url,
        chunk_size = config.upload.chunk_size,
        "HTTP: listening"
    );

    let app = http::router(AppState {
        store: store.clone(),
        config: Arc::new(config),
        metrics: metrics.clone(),
        cancel: cancel.clone(),
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;

    // Whatever ended the server, nothing may outlive the process.
    cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!("sweeper task ended abnormally: {e}");
    }
    match store.destroy_all().await {
        Ok(destroyed) => {
            metrics.record_destroyed(DestroyReason::Shutdown, destroyed as u64);
            info!(destroyed, "all packages destroyed");
        }
        Err(e) => error!(kind = %e.kind(), error = %e, "failed to destroy every package"),
    }
    metrics.set_live(store.len().await);

    served.context("HTTP server")?;
    info!("daemon stopped");
    Ok(())
}

/// Fail fast when memory cannot be locked, instead of on the first upload.
fn check_pinning(mode: PinMode) -> Result<()> {
    let mut probe = PinnedRegion::with_capacity(1, mode)
        .context("memory pinning unavailable (raise RLIMIT_MEMLOCK or set store.require_pinning = false)")?;
    if !probe.is_pinned() {
        warn!("memory pinning unavailable, packages may be swapped to disk");
    }
    probe.release().context("releasing pinning probe")?;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, cancelling in-flight uploads.
async fn shutdown_signal(cancel: CancellationToken) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("registering SIGTERM handler: {e}");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("waiting for SIGINT: {e}");
            }
            cancel.cancel();
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("waiting for SIGINT: {e}");
            }
            info!("SIGINT received, shutting down");
        }
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
    cancel.cancel();
}
