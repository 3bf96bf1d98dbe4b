//! Metrics collection and exposure.
//!
//! - **`Metrics`**: a lightweight, cloneable handle the pipeline uses to
//!   record what it observes: messages in, parse drops, dispatch outcomes.
//! - **`MetricsBuilder`**: installs the Prometheus recorder and prepares
//!   the HTTP listener; with the listener disabled it hands out no-op
//!   handles instead.
//! - **`RelayServer`** (in `server.rs`): the `axum` listener serving
//!   `/healthz` and `/metrics`.

use crate::config::HttpConfig;
use crate::internal_metrics::server::RelayServer;
use metrics::{Counter, Histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::error;

/// The public API for recording pipeline metrics.
#[derive(Clone)]
pub struct Metrics {
    pub messages_parse_failures_total: Counter,
    pub dispatches_attempted_total: Counter,
    pub dispatches_delivered_total: Counter,
    pub dispatch_duration_seconds: Histogram,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Creates a new `Metrics` instance and registers descriptions for all
    /// supported metrics with the global recorder.
    pub fn new() -> Self {
        metrics::describe_counter!(
            "messages_received_total",
            Unit::Count,
            "Total number of messages delivered by the broker subscription."
        );
        metrics::describe_counter!(
            "messages_parse_failures_total",
            Unit::Count,
            "Total number of inbound payloads dropped because they could not be parsed."
        );
        metrics::describe_counter!(
            "dispatches_attempted_total",
            Unit::Count,
            "Total number of alert dispatches handed to the notification provider."
        );
        metrics::describe_counter!(
            "dispatches_delivered_total",
            Unit::Count,
            "Total number of dispatches acknowledged by the provider."
        );
        metrics::describe_counter!(
            "dispatches_failed_total",
            Unit::Count,
            "Total number of failed dispatches, labeled by failure kind."
        );
        metrics::describe_histogram!(
            "dispatch_duration_seconds",
            Unit::Seconds,
            "Latency of one outbound provider call."
        );
        metrics::describe_gauge!(
            "broker_connection_status",
            Unit::Count,
            "Broker session status (1 for connected or subscribed, 0 otherwise)."
        );
        metrics::describe_counter!(
            "broker_disconnects_total",
            Unit::Count,
            "Total number of unsolicited broker disconnections."
        );

        Self {
            messages_parse_failures_total: metrics::counter!("messages_parse_failures_total"),
            dispatches_attempted_total: metrics::counter!("dispatches_attempted_total"),
            dispatches_delivered_total: metrics::counter!("dispatches_delivered_total"),
            dispatch_duration_seconds: metrics::histogram!("dispatch_duration_seconds"),
        }
    }

    /// Creates a `Metrics` instance that performs no operations. Used when
    /// the listener is disabled and in tests.
    pub fn disabled() -> Self {
        Self {
            messages_parse_failures_total: metrics::counter!("disabled"),
            dispatches_attempted_total: metrics::counter!("disabled"),
            dispatches_delivered_total: metrics::counter!("disabled"),
            dispatch_duration_seconds: metrics::histogram!("disabled"),
        }
    }

    /// Increments the per-kind dispatch failure counter.
    pub fn increment_dispatch_failure(&self, kind: &str) {
        metrics::counter!("dispatches_failed_total", "kind" => kind.to_string()).increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Builder for the metrics system and its HTTP listener.
pub struct MetricsBuilder {
    config: HttpConfig,
}

impl MetricsBuilder {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }

    /// Installs the Prometheus recorder and binds the listener, returning
    /// the `Metrics` handle plus the server (not yet spawned) and its
    /// bound address. Returns a disabled handle and no server when the
    /// listener is turned off or cannot be set up.
    pub fn build(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> (Metrics, Option<(RelayServer, SocketAddr)>) {
        if !self.config.enabled {
            return (Metrics::disabled(), None);
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .expect("static bucket list is non-empty")
            .build_recorder();
        let handle = recorder.handle();

        // Bind before installing the recorder so a bind failure leaves the
        // global recorder untouched.
        let listener = match std::net::TcpListener::bind(self.config.listen_address) {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "failed to bind liveness listener to {}: {}",
                    self.config.listen_address, e
                );
                return (Metrics::disabled(), None);
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("failed to get local address for liveness listener: {}", e);
                return (Metrics::disabled(), None);
            }
        };

        // The listener must be non-blocking to be used with Tokio.
        if listener.set_nonblocking(true).is_err() {
            return (Metrics::disabled(), None);
        }
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to register liveness listener with tokio: {}", e);
                return (Metrics::disabled(), None);
            }
        };

        if let Err(e) = metrics::set_global_recorder(recorder) {
            error!("failed to install Prometheus recorder: {}", e);
            return (Metrics::disabled(), None);
        }

        let metrics = Metrics::new();
        let server = RelayServer::new(listener, handle, shutdown_rx);
        (metrics, Some((server, addr)))
    }
}

pub mod server;
