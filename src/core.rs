//! Core domain types and service traits for the relay.
//!
//! This module defines the values that flow through the pipeline and the
//! trait contracts that govern component interactions.

use crate::errors::{DeliveryError, ParseError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One message as received from the broker. Transient: consumed by the
/// relay controller and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The topic the message was delivered on.
    pub topic: String,
    /// The raw payload, treated as opaque UTF-8 text.
    pub payload: String,
    /// When this process received the message.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// The content to forward through the notification provider.
///
/// Body length and character-set constraints of the provider are a
/// precondition on the configured payloads, not enforced here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertRequest {
    /// Destination identifier (e.g. an E.164 phone number).
    pub to: String,
    /// Sender identifier registered with the provider.
    pub from: String,
    /// The alert text.
    pub body: String,
}

/// Provider acknowledgment of a successful dispatch. Logged, then
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReceipt {
    /// The provider-assigned identifier for the outbound message.
    pub provider_id: String,
}

/// Outcome of one dispatch attempt.
pub type DeliveryResult = Result<DeliveryReceipt, DeliveryError>;

/// Derives an [`AlertRequest`] from an inbound payload.
///
/// The payload is opaque text unless it happens to be a JSON object, in
/// which case the alert text is taken from its `message` field (the shape
/// the upstream publisher emits). Plain text passes through verbatim.
///
/// Total over all inputs: every payload yields a request or a
/// [`ParseError`], never a panic.
pub fn parse_alert(
    message: &InboundMessage,
    to: &str,
    from: &str,
) -> Result<AlertRequest, ParseError> {
    let payload = message.payload.trim();
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }

    let body = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => match map.get("message") {
            Some(serde_json::Value::String(text)) => text.clone(),
            _ => return Err(ParseError::MissingMessageField),
        },
        // Not a JSON object: forward the raw text as the alert body.
        _ => payload.to_string(),
    };

    Ok(AlertRequest {
        to: to.to_string(),
        from: from.to_string(),
        body,
    })
}

// =============================================================================
// Service Traits
// =============================================================================

/// Delivers one alert through an external notification provider.
///
/// Implementations make exactly one outbound call per invocation: no
/// batching, no deduplication, no retry. Each call is independent, so any
/// number of dispatches may be in flight concurrently.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    /// A short, descriptive name for the provider (e.g. "sms"). Used for
    /// logging and metrics.
    fn name(&self) -> &str;

    /// Sends the alert, returning the provider-assigned identifier on
    /// success or a [`DeliveryError`] describing the rejection.
    async fn send(&self, request: &AlertRequest) -> DeliveryResult;
}
