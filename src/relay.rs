//! The relay controller: the only component that knows both the broker
//! session and the alert dispatcher.
//!
//! Startup (connect, then subscribe) is sequenced by [`crate::app`] and is
//! fail-fast. This module owns steady state: each inbound message is
//! parsed and, when dispatch is enabled, handed to the dispatcher on its
//! own task so intake is never serialized behind dispatch latency.
//!
//! Ordering: the provider call for each message is entered inline in the
//! intake loop (its first poll happens before the next message is read),
//! then the remainder of the call moves to its own task. Entry order
//! therefore matches arrival order on any runtime flavor, while
//! completion order is unconstrained. A parse failure drops that one
//! message; a delivery failure is logged and the pipeline moves on.
//! Neither is retried.

use crate::broker::{BrokerConnection, DisconnectReason};
use crate::config::{DispatchConfig, SmsConfig};
use crate::core::{parse_alert, AlertDispatcher, InboundMessage};
use crate::internal_metrics::Metrics;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Consumes inbound messages and fans dispatches out to the provider.
pub struct RelayController {
    dispatcher: Option<Arc<dyn AlertDispatcher>>,
    to_number: String,
    from_number: String,
    max_in_flight: usize,
    metrics: Metrics,
}

impl RelayController {
    /// Creates a controller. `dispatcher` is `None` when dispatch is
    /// disabled (`dispatch.enabled = false` or `--dry-run`): alerts are
    /// then parsed and logged but never forwarded.
    pub fn new(
        dispatcher: Option<Arc<dyn AlertDispatcher>>,
        sms: &SmsConfig,
        dispatch: &DispatchConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            dispatcher,
            to_number: sms.to_number.clone(),
            from_number: sms.from_number.clone(),
            max_in_flight: dispatch.max_in_flight,
            metrics,
        }
    }

    /// Runs the intake loop until shutdown or channel close.
    ///
    /// Shutdown policy: stop accepting messages first, then wait for every
    /// in-flight dispatch to complete. No dispatch is cancelled mid-call.
    pub async fn run(
        self,
        mut inbound_rx: mpsc::Receiver<InboundMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("relay controller received shutdown signal");
                    break;
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                message = inbound_rx.recv() => {
                    match message {
                        Some(message) => {
                            self.handle_message(message, &semaphore, &mut in_flight).await;
                        }
                        None => {
                            info!("inbound channel closed, relay controller stopping");
                            break;
                        }
                    }
                }
            }
        }

        drop(inbound_rx);
        let outstanding = in_flight.len();
        if outstanding > 0 {
            info!("draining {} in-flight dispatches", outstanding);
        }
        while in_flight.join_next().await.is_some() {}
        info!("relay controller finished");
    }

    async fn handle_message(
        &self,
        message: InboundMessage,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) {
        debug!(topic = %message.topic, payload = %message.payload, "message arrived");

        let request = match parse_alert(&message, &self.to_number, &self.from_number) {
            Ok(request) => request,
            Err(e) => {
                // Per-message, recoverable: drop it and keep going.
                warn!(topic = %message.topic, error = %e, "dropping unparsable payload");
                self.metrics.messages_parse_failures_total.increment(1);
                return;
            }
        };

        let Some(dispatcher) = self.dispatcher.clone() else {
            info!(body = %request.body, "dispatch disabled, alert not forwarded");
            return;
        };

        // Acquiring the permit here, in the intake loop, bounds how many
        // provider calls are in flight at once.
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };

        self.metrics.dispatches_attempted_total.increment(1);
        let metrics = self.metrics.clone();
        let mut dispatch = Box::pin(async move {
            let _permit = permit;
            let start = Instant::now();
            let outcome = dispatcher.send(&request).await;
            metrics
                .dispatch_duration_seconds
                .record(start.elapsed().as_secs_f64());
            match outcome {
                Ok(receipt) => {
                    info!(
                        provider = dispatcher.name(),
                        provider_id = %receipt.provider_id,
                        "alert dispatched"
                    );
                    metrics.dispatches_delivered_total.increment(1);
                }
                Err(e) => {
                    // Logged, not retried; the next message is unaffected.
                    error!(provider = dispatcher.name(), kind = e.kind(), error = %e, "dispatch failed");
                    metrics.increment_dispatch_failure(e.kind());
                }
            }
        });

        // Enter the provider call before reading the next message, so the
        // dispatcher sees requests in arrival order even on a
        // multi-threaded runtime. The call then completes on its own task.
        if futures::poll!(dispatch.as_mut()).is_pending() {
            in_flight.spawn(dispatch);
        }
    }
}

/// Drives the broker session after startup.
///
/// The connection itself never retries; this supervisor is the caller
/// that does. After an unsolicited loss it re-dials with capped
/// exponential backoff plus jitter, resetting the backoff once a session
/// is re-established. With `broker.reconnect` disabled the task ends on
/// first loss and the process stays up, idle, pending external restart.
pub async fn supervise_connection(
    mut connection: BrokerConnection,
    inbound_tx: mpsc::Sender<InboundMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let reconnect = connection.config().reconnect;
    let topic = connection.config().topic.clone();
    let initial_backoff = Duration::from_millis(connection.config().reconnect_initial_backoff_ms);
    let max_backoff = Duration::from_millis(connection.config().reconnect_max_backoff_ms);

    loop {
        match connection.run(shutdown_rx.clone()).await {
            DisconnectReason::Requested => {
                info!("broker session closed on request");
                return;
            }
            DisconnectReason::ConnectionLost => {
                if !reconnect {
                    warn!("broker connection lost and reconnect is disabled; session stays down");
                    return;
                }
            }
        }

        let mut backoff = initial_backoff;
        loop {
            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            info!("reconnecting to broker in {:?}", backoff + jitter);
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(backoff + jitter) => {}
            }

            match connection.connect().await {
                Ok(()) => match connection.subscribe(&topic, inbound_tx.clone()).await {
                    Ok(()) => {
                        info!(topic = %topic, "broker session re-established");
                        break;
                    }
                    Err(e) => {
                        error!("re-subscribe failed: {}", e);
                        connection.disconnect().await;
                    }
                },
                Err(e) => {
                    error!("reconnect failed: {}", e);
                }
            }

            backoff = std::cmp::min(backoff * 2, max_backoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::{AlertRequest, DeliveryReceipt, DeliveryResult};
    use crate::errors::DeliveryError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every request it is asked to send; optionally fails some.
    struct RecordingDispatcher {
        sent: Mutex<Vec<AlertRequest>>,
        fail_bodies: Vec<String>,
    }

    impl RecordingDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_bodies: Vec::new(),
            })
        }

        fn failing_on(body: &str) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail_bodies: vec![body.to_string()],
            })
        }

        fn bodies(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|r| r.body.clone()).collect()
        }
    }

    #[async_trait]
    impl AlertDispatcher for RecordingDispatcher {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, request: &AlertRequest) -> DeliveryResult {
            self.sent.lock().unwrap().push(request.clone());
            // Stay in flight past the first poll, like a real provider call.
            tokio::task::yield_now().await;
            if self.fail_bodies.contains(&request.body) {
                return Err(DeliveryError::RateLimited("simulated".to_string()));
            }
            Ok(DeliveryReceipt {
                provider_id: "SM0001".to_string(),
            })
        }
    }

    fn controller(dispatcher: Option<Arc<dyn AlertDispatcher>>) -> RelayController {
        let config = Config::default();
        RelayController::new(dispatcher, &config.sms, &config.dispatch, Metrics::disabled())
    }

    async fn run_through(
        controller: RelayController,
        payloads: &[&str],
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for payload in payloads {
            tx.send(InboundMessage::new("userTopic", *payload)).await.unwrap();
        }
        drop(tx);
        controller.run(rx, shutdown_rx).await;
    }

    #[tokio::test]
    async fn test_dispatches_follow_arrival_order() {
        let dispatcher = RecordingDispatcher::new();
        let controller = controller(Some(dispatcher.clone()));
        run_through(controller, &["first", "second", "third"]).await;
        assert_eq!(dispatcher.bodies(), vec!["first", "second", "third"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_entry_order_holds_on_a_multithreaded_runtime() {
        // Many short rounds: an ordering race would surface as a shuffled
        // entry sequence in at least some of them.
        for _ in 0..20 {
            let dispatcher = RecordingDispatcher::new();
            let controller = controller(Some(dispatcher.clone()));
            let payloads: Vec<String> = (0..20).map(|i| format!("alert {i:02}")).collect();
            let refs: Vec<&str> = payloads.iter().map(String::as_str).collect();
            run_through(controller, &refs).await;
            assert_eq!(dispatcher.bodies(), payloads);
        }
    }

    #[tokio::test]
    async fn test_parse_failure_does_not_stop_the_pipeline() {
        let dispatcher = RecordingDispatcher::new();
        let controller = controller(Some(dispatcher.clone()));
        run_through(controller, &["before", "", "after"]).await;
        assert_eq!(dispatcher.bodies(), vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_stop_the_pipeline() {
        let dispatcher = RecordingDispatcher::failing_on("doomed");
        let controller = controller(Some(dispatcher.clone()));
        run_through(controller, &["doomed", "healthy"]).await;
        assert_eq!(dispatcher.bodies(), vec!["doomed", "healthy"]);
    }

    #[tokio::test]
    async fn test_disabled_dispatch_never_calls_the_provider() {
        let dispatcher = RecordingDispatcher::new();
        // The controller is built without a dispatcher, as `--dry-run` does.
        let controller = controller(None);
        run_through(controller, &["temp=105F threshold exceeded"]).await;
        assert!(dispatcher.bodies().is_empty());
    }
}
