//! Prometheus metrics server with one-shot global initialization.
//!
//! `init_global` installs the recorder and serves `/metrics` and `/health`.
//! `init_test` installs the recorder only and tolerates concurrent callers.

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Handle to the installed Prometheus recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)
}

/// Install the recorder and start the HTTP endpoint on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Fails if metrics were already initialized or the recorder cannot be
/// installed.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    if CONTROLLER.get().is_some() {
        return AlreadyInitializedSnafu.fail();
    }

    let handle = install_recorder()?;
    CONTROLLER
        .set(MetricsController {
            handle: handle.clone(),
        })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(run_server(addr, handle));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint.
///
/// Safe to call repeatedly from concurrent test threads.
pub fn init_test() {
    if CONTROLLER.get().is_some() {
        return;
    }
    match install_recorder() {
        Ok(handle) => {
            let _ = CONTROLLER.set(MetricsController { handle });
        }
        Err(_) => {
            // Another thread won the race to install the recorder
            while CONTROLLER.get().is_none() {
                std::hint::spin_loop();
            }
        }
    }
}

impl MetricsController {
    /// Get the global controller.
    ///
    /// # Errors
    ///
    /// Returns an error if metrics have not been initialized.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Metrics server error");
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler() -> &'static str {
    "ok\n"
}
