//! Wire transport for the broker session.
//!
//! The broker speaks a small JSON frame protocol over WebSocket. The
//! [`BrokerTransport`] trait abstracts the wire so the session logic and
//! the tests never need a live broker.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, connect_async_tls_with_config, tungstenite::Message, Connector,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

/// Frames sent from the client to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Opens a logical session. The broker answers with `conn_ack`.
    Connect {
        client_id: String,
        username: String,
        password: String,
    },
    /// Requests delivery for a topic. The broker answers with `sub_ack`.
    Subscribe { topic: String },
    /// Announces a graceful close. No acknowledgment is expected.
    Disconnect,
}

/// Frames sent from the broker to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerFrame {
    ConnAck {
        ok: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    SubAck {
        topic: String,
        ok: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    Message { topic: String, payload: String },
}

/// A bidirectional broker link, abstracted to enable testing with fake
/// implementations.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Writes one frame to the broker.
    async fn send(&mut self, frame: ClientFrame) -> Result<()>;

    /// Reads the next frame from the broker.
    ///
    /// # Returns
    /// * `Some(Ok(frame))` if a frame was successfully received
    /// * `Some(Err(error))` if the link failed while reading
    /// * `None` if the connection has been closed
    async fn recv(&mut self) -> Option<Result<BrokerFrame>>;

    /// Closes the link. Best-effort; errors are reported but the link is
    /// considered gone either way.
    async fn close(&mut self) -> Result<()>;
}

/// Production transport: JSON frames over a (possibly TLS) WebSocket.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    /// Dials the broker endpoint and completes the WebSocket handshake.
    /// No session frames are exchanged yet.
    pub async fn dial(endpoint: &str, allow_invalid_certs: bool) -> Result<Self> {
        let stream = if allow_invalid_certs {
            warn!("TLS certificate validation is disabled for the broker connection");
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()?;
            let (stream, _) = connect_async_tls_with_config(
                endpoint,
                None,
                false,
                Some(Connector::NativeTls(tls)),
            )
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to {}: {}", endpoint, e))?;
            stream
        } else {
            let (stream, _) = connect_async(endpoint)
                .await
                .map_err(|e| anyhow::anyhow!("failed to connect to {}: {}", endpoint, e))?;
            stream
        };

        debug!(endpoint, "WebSocket established");
        Ok(Self { stream })
    }
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let json = serde_json::to_string(&frame)?;
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<BrokerFrame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<BrokerFrame>(text.as_str()) {
                        Ok(frame) => return Some(Ok(frame)),
                        Err(e) => {
                            // A malformed frame is dropped, not fatal.
                            warn!("failed to parse broker frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("received binary message, ignoring");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    debug!("received keepalive frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("received close frame from broker");
                    return None;
                }
                Some(Ok(Message::Frame(_))) => {
                    debug!("received raw frame, ignoring");
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket error: {}", e)));
                }
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_serialize_with_op_tag() {
        let frame = ClientFrame::Subscribe {
            topic: "userTopic".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["topic"], "userTopic");
    }

    #[test]
    fn test_broker_message_frame_parses() {
        let frame: BrokerFrame = serde_json::from_str(
            r#"{"op": "message", "topic": "userTopic", "payload": "temp=105F threshold exceeded"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            BrokerFrame::Message {
                topic: "userTopic".to_string(),
                payload: "temp=105F threshold exceeded".to_string(),
            }
        );
    }

    #[test]
    fn test_conn_ack_reason_is_optional() {
        let frame: BrokerFrame = serde_json::from_str(r#"{"op": "conn_ack", "ok": true}"#).unwrap();
        assert_eq!(frame, BrokerFrame::ConnAck { ok: true, reason: None });

        let frame: BrokerFrame = serde_json::from_str(
            r#"{"op": "conn_ack", "ok": false, "reason": "bad credentials"}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            BrokerFrame::ConnAck {
                ok: false,
                reason: Some("bad credentials".to_string()),
            }
        );
    }
}
