//! Broker session lifecycle.
//!
//! [`BrokerConnection`] owns exactly one logical broker session: it
//! establishes the connection, performs the credential handshake, manages
//! the single topic subscription, and delivers each received message
//! exactly once, in broker order, to a registered channel.
//!
//! The connection itself carries no retry policy. A failed connect or an
//! unsolicited loss is reported to the caller (through the return value
//! and the session-state watch channel) and the caller decides whether to
//! re-dial.

pub mod transport;

use crate::config::BrokerConfig;
use crate::core::InboundMessage;
use crate::errors::{ConnectionError, SubscribeError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use transport::{BrokerFrame, BrokerTransport, ClientFrame, WsTransport};

/// Lifecycle state of a broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live transport. Initial and terminal state.
    Disconnected,
    /// Transport dialed, waiting for the broker to acknowledge.
    Connecting,
    /// Session acknowledged; no active subscription yet.
    Connected,
    /// Receiving messages for the subscribed topic.
    Subscribed,
}

/// One logical broker connection and its current lifecycle state.
///
/// A plain value owned by its [`BrokerConnection`]; independent sessions
/// can coexist (there is no process-global client handle).
#[derive(Debug, Clone)]
pub struct Session {
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// The subscribed topic, once a subscription has been established.
    pub topic: Option<String>,
    /// Current lifecycle state.
    pub state: SessionState,
}

/// Why a receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Local shutdown or explicit disconnect.
    Requested,
    /// The broker closed the link or the transport failed.
    ConnectionLost,
}

enum Step {
    Shutdown,
    Frame(Option<anyhow::Result<BrokerFrame>>),
}

/// Owns the lifecycle of a single broker session.
pub struct BrokerConnection {
    config: BrokerConfig,
    session: Session,
    transport: Option<Box<dyn BrokerTransport>>,
    delivery: Option<(String, mpsc::Sender<InboundMessage>)>,
    state_tx: watch::Sender<SessionState>,
}

impl BrokerConnection {
    /// Creates a new, disconnected connection. The returned watch receiver
    /// observes every session state transition, including unsolicited
    /// connection loss.
    pub fn new(config: BrokerConfig) -> (Self, watch::Receiver<SessionState>) {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let connection = Self {
            session: Session {
                client_id: config.client_id.clone(),
                topic: None,
                state: SessionState::Disconnected,
            },
            config,
            transport: None,
            delivery: None,
            state_tx,
        };
        (connection, state_rx)
    }

    /// The session owned by this connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The broker settings this connection was built with.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.session.state != state {
            debug!(from = ?self.session.state, to = ?state, "session state transition");
        }
        self.session.state = state;
        self.state_tx.send_replace(state);
        let connected = matches!(state, SessionState::Connected | SessionState::Subscribed);
        metrics::gauge!("broker_connection_status").set(if connected { 1.0 } else { 0.0 });
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handshake_timeout_ms)
    }

    /// Dials the configured endpoint and performs the credential
    /// handshake. On any failure the session is back in `Disconnected`
    /// and the process keeps running; retry is the caller's decision.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.set_state(SessionState::Connecting);
        let transport = match WsTransport::dial(
            &self.config.endpoint,
            self.config.allow_invalid_certs,
        )
        .await
        {
            Ok(transport) => Box::new(transport) as Box<dyn BrokerTransport>,
            Err(e) => {
                self.set_state(SessionState::Disconnected);
                return Err(ConnectionError::Transport(e.to_string()));
            }
        };
        self.handshake(transport).await
    }

    /// Performs the credential handshake over a caller-supplied transport.
    /// This is the entry point for tests running against a fake broker.
    pub async fn connect_over(
        &mut self,
        transport: Box<dyn BrokerTransport>,
    ) -> Result<(), ConnectionError> {
        self.set_state(SessionState::Connecting);
        self.handshake(transport).await
    }

    async fn handshake(
        &mut self,
        mut transport: Box<dyn BrokerTransport>,
    ) -> Result<(), ConnectionError> {
        // A connect on a live session replaces the transport; the old one
        // must not be left open.
        if let Some(mut old) = self.transport.take() {
            debug!("closing previous transport before reconnecting");
            let _ = old.close().await;
        }

        let connect = ClientFrame::Connect {
            client_id: self.config.client_id.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        if let Err(e) = transport.send(connect).await {
            self.set_state(SessionState::Disconnected);
            return Err(ConnectionError::Transport(e.to_string()));
        }

        let deadline = self.handshake_timeout();
        let ack = timeout(deadline, async {
            loop {
                match transport.recv().await {
                    Some(Ok(BrokerFrame::ConnAck { ok, reason })) => {
                        return Ok((ok, reason));
                    }
                    Some(Ok(frame)) => {
                        debug!(?frame, "ignoring frame while awaiting connection ack");
                    }
                    Some(Err(e)) => return Err(ConnectionError::Transport(e.to_string())),
                    None => {
                        return Err(ConnectionError::Transport(
                            "connection closed during handshake".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match ack {
            Ok(Ok((true, _))) => {
                info!(client_id = %self.session.client_id, "connected to broker");
                self.transport = Some(transport);
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Ok(Ok((false, reason))) => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                let _ = transport.close().await;
                self.set_state(SessionState::Disconnected);
                Err(ConnectionError::Rejected(reason))
            }
            Ok(Err(e)) => {
                self.set_state(SessionState::Disconnected);
                Err(e)
            }
            Err(_) => {
                let _ = transport.close().await;
                self.set_state(SessionState::Disconnected);
                Err(ConnectionError::Timeout(deadline))
            }
        }
    }

    /// Registers `tx` as the delivery channel for `topic` and issues the
    /// subscription to the broker.
    ///
    /// Re-subscribing to the already-active topic is idempotent: the new
    /// channel replaces the old one and no wire traffic is generated, so
    /// there is never more than one delivery per message. A rejected
    /// subscription leaves the session `Connected` and usable.
    pub async fn subscribe(
        &mut self,
        topic: &str,
        tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), SubscribeError> {
        match self.session.state {
            SessionState::Connected => {}
            SessionState::Subscribed => {
                if self.session.topic.as_deref() == Some(topic) {
                    debug!(topic, "replacing delivery channel for active subscription");
                    self.delivery = Some((topic.to_string(), tx));
                    return Ok(());
                }
            }
            _ => return Err(SubscribeError::NotConnected),
        }

        let deadline = self.handshake_timeout();
        let transport = self.transport.as_mut().ok_or(SubscribeError::NotConnected)?;
        transport
            .send(ClientFrame::Subscribe {
                topic: topic.to_string(),
            })
            .await
            .map_err(|e| SubscribeError::Transport(e.to_string()))?;

        let delivery = &self.delivery;
        let ack = timeout(deadline, async {
            loop {
                match transport.recv().await {
                    Some(Ok(BrokerFrame::SubAck { topic, ok, reason })) => {
                        return Ok((topic, ok, reason));
                    }
                    Some(Ok(BrokerFrame::Message { topic, payload })) => {
                        // A message from a previous subscription may race
                        // the ack; deliver it rather than drop it.
                        if let Some((active, tx)) = delivery {
                            if *active == topic {
                                let _ = tx.send(InboundMessage::new(topic, payload)).await;
                                continue;
                            }
                        }
                        debug!(topic, "dropping message for inactive topic");
                    }
                    Some(Ok(frame)) => {
                        debug!(?frame, "ignoring frame while awaiting subscription ack");
                    }
                    Some(Err(e)) => return Err(SubscribeError::Transport(e.to_string())),
                    None => {
                        return Err(SubscribeError::Transport(
                            "connection closed while subscribing".to_string(),
                        ))
                    }
                }
            }
        })
        .await;

        match ack {
            Ok(Ok((acked_topic, true, _))) => {
                info!(topic = %acked_topic, "subscribed");
                self.session.topic = Some(topic.to_string());
                self.delivery = Some((topic.to_string(), tx));
                self.set_state(SessionState::Subscribed);
                Ok(())
            }
            Ok(Ok((acked_topic, false, reason))) => Err(SubscribeError::Rejected {
                topic: acked_topic,
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SubscribeError::Timeout(deadline)),
        }
    }

    /// Receives frames until shutdown or connection loss, forwarding each
    /// on-topic message exactly once to the registered delivery channel.
    ///
    /// The loop performs only bounded work per message (a channel send);
    /// dispatch latency never delays delivery. Always leaves the session
    /// `Disconnected`.
    pub async fn run(&mut self, mut shutdown_rx: watch::Receiver<bool>) -> DisconnectReason {
        loop {
            let step = {
                let transport = match self.transport.as_mut() {
                    Some(transport) => transport,
                    None => {
                        self.set_state(SessionState::Disconnected);
                        return DisconnectReason::ConnectionLost;
                    }
                };
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => Step::Shutdown,
                    frame = transport.recv() => Step::Frame(frame),
                }
            };

            match step {
                Step::Shutdown => {
                    info!("broker receive loop received shutdown signal");
                    self.disconnect().await;
                    return DisconnectReason::Requested;
                }
                Step::Frame(Some(Ok(BrokerFrame::Message { topic, payload }))) => {
                    metrics::counter!("messages_received_total").increment(1);
                    match &self.delivery {
                        Some((active, tx)) if *active == topic => {
                            if tx.send(InboundMessage::new(topic, payload)).await.is_err() {
                                error!("delivery channel closed, stopping receive loop");
                                self.disconnect().await;
                                return DisconnectReason::Requested;
                            }
                        }
                        _ => {
                            debug!(topic, "dropping message for inactive topic");
                        }
                    }
                }
                Step::Frame(Some(Ok(frame))) => {
                    debug!(?frame, "ignoring unexpected broker frame");
                }
                Step::Frame(Some(Err(e))) => {
                    error!("broker transport error: {}", e);
                    metrics::counter!("broker_disconnects_total").increment(1);
                    self.transport = None;
                    self.delivery = None;
                    self.set_state(SessionState::Disconnected);
                    return DisconnectReason::ConnectionLost;
                }
                Step::Frame(None) => {
                    warn!("broker closed the connection");
                    metrics::counter!("broker_disconnects_total").increment(1);
                    self.transport = None;
                    self.delivery = None;
                    self.set_state(SessionState::Disconnected);
                    return DisconnectReason::ConnectionLost;
                }
            }
        }
    }

    /// Best-effort graceful close. The session is `Disconnected` when this
    /// returns, even if the transport refused to close cleanly.
    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.send(ClientFrame::Disconnect).await {
                debug!("failed to send disconnect frame: {}", e);
            }
            if let Err(e) = transport.close().await {
                debug!("failed to close broker transport: {}", e);
            }
        }
        self.delivery = None;
        self.set_state(SessionState::Disconnected);
    }
}
