//! The main application logic, decoupled from the entry point.

use crate::{
    broker::{transport::BrokerTransport, BrokerConnection, SessionState},
    config::Config,
    core::{AlertDispatcher, InboundMessage},
    internal_metrics::{Metrics, MetricsBuilder},
    notification::sms::SmsClient,
    relay::{supervise_connection, RelayController},
    task_manager::TaskManager,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument};

/// A handle to the running application.
#[derive(Debug)]
pub struct App {
    task_manager: TaskManager,
    listener_addr: Option<SocketAddr>,
    session_state: Option<watch::Receiver<SessionState>>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    /// Address of the liveness/metrics listener, when enabled.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_addr
    }

    /// Observes broker session state transitions, including unsolicited
    /// connection loss. `None` when the app was built around an injected
    /// inbound channel instead of a broker session.
    pub fn session_state(&self) -> Option<watch::Receiver<SessionState>> {
        self.session_state.clone()
    }

    /// Waits for the shutdown signal, then gracefully joins all tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        shutdown_rx.changed().await.ok();
        info!("shutdown signal received, waiting for tasks to complete");
        self.task_manager.shutdown().await;
        Ok(())
    }
}

/// Builder for the main application.
///
/// Separates constructing the components from running them, and lets
/// tests override the broker transport, the dispatcher, the metrics
/// handle, or the inbound channel itself.
pub struct AppBuilder {
    config: Config,
    transport_override: Option<Box<dyn BrokerTransport>>,
    dispatcher_override: Option<Arc<dyn AlertDispatcher>>,
    metrics_override: Option<Metrics>,
    inbound_rx_for_test: Option<mpsc::Receiver<InboundMessage>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport_override: None,
            dispatcher_override: None,
            metrics_override: None,
            inbound_rx_for_test: None,
        }
    }

    /// Overrides the broker transport, so the session handshake runs
    /// against a fake broker.
    pub fn transport_override(mut self, transport: Box<dyn BrokerTransport>) -> Self {
        self.transport_override = Some(transport);
        self
    }

    /// Overrides the alert dispatcher.
    pub fn dispatcher_override(mut self, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        self.dispatcher_override = Some(dispatcher);
        self
    }

    /// Overrides the metrics system, skipping recorder installation.
    pub fn metrics_override(mut self, metrics: Metrics) -> Self {
        self.metrics_override = Some(metrics);
        self
    }

    /// Bypasses the broker entirely: messages sent on the paired channel
    /// feed the pipeline directly.
    pub fn inbound_rx_for_test(mut self, rx: mpsc::Receiver<InboundMessage>) -> Self {
        self.inbound_rx_for_test = Some(rx);
        self
    }

    /// Builds and starts all application components.
    ///
    /// Startup is fail-fast: a missing configuration value, a rejected
    /// connect, or a rejected subscribe surfaces as an error here and the
    /// process never enters a half-initialized running state.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        config.validate()?;
        let task_manager = TaskManager::new(shutdown_rx);

        // =====================================================================
        // 1. Metrics and the liveness listener
        // =====================================================================
        let (metrics, server_info) = match self.metrics_override {
            Some(metrics) => (metrics, None),
            None => MetricsBuilder::new(config.http.clone()).build(task_manager.get_shutdown_rx()),
        };
        let listener_addr = if let Some((server, addr)) = server_info {
            info!(%addr, "liveness listener bound");
            task_manager.spawn("RelayServer", server.run());
            Some(addr)
        } else {
            None
        };

        // =====================================================================
        // 2. Dispatcher
        // =====================================================================
        let dispatcher: Option<Arc<dyn AlertDispatcher>> = if !config.dispatch.enabled {
            info!("dispatch is disabled; alerts will be parsed and logged only");
            None
        } else if let Some(dispatcher) = self.dispatcher_override {
            Some(dispatcher)
        } else {
            Some(Arc::new(SmsClient::new(&config.sms)?))
        };

        // =====================================================================
        // 3. Broker session: connect then subscribe, in sequence
        // =====================================================================
        let (inbound_rx, session_state) = if let Some(rx) = self.inbound_rx_for_test {
            (rx, None)
        } else {
            let (inbound_tx, inbound_rx) = mpsc::channel(1024);
            let (mut connection, state_rx) = BrokerConnection::new(config.broker.clone());

            match self.transport_override {
                Some(transport) => connection
                    .connect_over(transport)
                    .await
                    .context("failed to establish broker session")?,
                None => connection
                    .connect()
                    .await
                    .context("failed to establish broker session")?,
            }
            connection
                .subscribe(&config.broker.topic, inbound_tx.clone())
                .await
                .context("failed to subscribe")?;

            task_manager.spawn(
                "BrokerSession",
                supervise_connection(connection, inbound_tx, task_manager.get_shutdown_rx()),
            );
            (inbound_rx, Some(state_rx))
        };

        // =====================================================================
        // 4. Relay controller
        // =====================================================================
        let controller =
            RelayController::new(dispatcher, &config.sms, &config.dispatch, metrics.clone());
        let controller_shutdown_rx = task_manager.get_shutdown_rx();
        task_manager.spawn(
            "RelayController",
            controller.run(inbound_rx, controller_shutdown_rx),
        );

        info!("sparkrelay initialized, relaying messages");

        Ok(App {
            task_manager,
            listener_addr,
            session_state,
        })
    }
}
