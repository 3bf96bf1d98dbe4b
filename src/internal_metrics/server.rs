//! # Liveness and metrics listener
//!
//! A small `axum` server exposing `GET /healthz` for liveness probes and
//! `GET /metrics` in Prometheus exposition format. It exposes no core
//! behavior: the relay works identically with the listener disabled.
//!
//! The server is designed for graceful shutdown, listening to a signal
//! from the main application to stop serving requests and terminate
//! cleanly.

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, trace};

/// The liveness/metrics HTTP listener.
pub struct RelayServer {
    listener: TcpListener,
    prom_handle: PrometheusHandle,
    shutdown_rx: watch::Receiver<bool>,
}

impl RelayServer {
    /// Creates a new `RelayServer` but does not spawn it.
    ///
    /// # Arguments
    ///
    /// * `listener` - A `TcpListener` that has already been bound to an address.
    /// * `prom_handle` - A `PrometheusHandle` used to render the metrics.
    /// * `shutdown_rx` - A watch channel receiver for graceful shutdown.
    pub fn new(
        listener: TcpListener,
        prom_handle: PrometheusHandle,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            listener,
            prom_handle,
            shutdown_rx,
        }
    }

    /// Returns a future that runs the server until a shutdown signal is
    /// received.
    pub fn run(mut self) -> impl Future<Output = ()> {
        let app = Router::new()
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/metrics",
                get(move || async move { self.prom_handle.render() }),
            );

        async move {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    trace!("liveness listener received shutdown signal");
                }
                result = axum::serve(self.listener, app.into_make_service()) => {
                    if let Err(e) = result {
                        // Expected during graceful shutdown when the server is dropped.
                        if !e.to_string().contains("operation was canceled") {
                            error!("liveness listener error: {}", e);
                        }
                    }
                }
            }
            trace!("liveness listener task finished");
        }
    }
}
