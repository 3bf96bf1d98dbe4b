//! In-memory transport for driving a broker session without a real server.

use async_trait::async_trait;
use sparkrelay::broker::transport::{BrokerFrame, BrokerTransport, ClientFrame};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Test-side handle for the broker end of the connection. Frames pushed
/// here come out of the paired [`MockTransport`]'s `recv`, and everything
/// the client sends is recorded for inspection.
#[derive(Clone)]
pub struct MockBroker {
    frame_tx: mpsc::UnboundedSender<Option<anyhow::Result<BrokerFrame>>>,
    sent: Arc<Mutex<Vec<ClientFrame>>>,
}

impl MockBroker {
    pub fn new() -> (Self, MockTransport) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let broker = Self {
            frame_tx,
            sent: Arc::clone(&sent),
        };
        let transport = MockTransport {
            frame_rx,
            sent,
            closed: false,
        };
        (broker, transport)
    }

    pub fn accept_session(&self) {
        self.push(BrokerFrame::ConnAck {
            ok: true,
            reason: None,
        });
    }

    pub fn reject_session(&self, reason: &str) {
        self.push(BrokerFrame::ConnAck {
            ok: false,
            reason: Some(reason.to_string()),
        });
    }

    pub fn ack_subscription(&self, topic: &str) {
        self.push(BrokerFrame::SubAck {
            topic: topic.to_string(),
            ok: true,
            reason: None,
        });
    }

    pub fn reject_subscription(&self, topic: &str, reason: &str) {
        self.push(BrokerFrame::SubAck {
            topic: topic.to_string(),
            ok: false,
            reason: Some(reason.to_string()),
        });
    }

    pub fn publish(&self, topic: &str, payload: &str) {
        self.push(BrokerFrame::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }

    pub fn push(&self, frame: BrokerFrame) {
        let _ = self.frame_tx.send(Some(Ok(frame)));
    }

    /// Simulates an unsolicited connection loss: the transport starts
    /// reporting end-of-stream.
    pub fn drop_connection(&self) {
        let _ = self.frame_tx.send(None);
    }

    pub fn sent_frames(&self) -> Vec<ClientFrame> {
        self.sent.lock().unwrap().clone()
    }
}

pub struct MockTransport {
    frame_rx: mpsc::UnboundedReceiver<Option<anyhow::Result<BrokerFrame>>>,
    sent: Arc<Mutex<Vec<ClientFrame>>>,
    closed: bool,
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn send(&mut self, frame: ClientFrame) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<BrokerFrame>> {
        if self.closed {
            return None;
        }
        match self.frame_rx.recv().await {
            Some(Some(item)) => Some(item),
            Some(None) | None => {
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}
