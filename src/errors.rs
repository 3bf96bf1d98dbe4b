//! Error taxonomy for the relay pipeline.
//!
//! Each component boundary reports a concrete error type; only the
//! composition roots (`app`, `main`) fold them into `anyhow`. Fatal
//! errors (`ConfigError`, startup connect/subscribe failures) terminate
//! the process; everything else is contained and logged.

use std::time::Duration;
use thiserror::Error;

/// A required configuration value is missing or unusable. Always fatal,
/// raised before any connection attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required configuration value `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure to establish a broker session. Non-fatal to the process; the
/// caller decides whether and when to retry.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker did not acknowledge the connection within {0:?}")]
    Timeout(Duration),
}

/// Failure to establish a topic subscription on a live session. The
/// session itself remains usable.
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("cannot subscribe: session is not connected")]
    NotConnected,

    #[error("broker rejected subscription to `{topic}`: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker did not acknowledge the subscription within {0:?}")]
    Timeout(Duration),
}

/// A single inbound payload could not be turned into an alert request.
/// The message is dropped and the pipeline continues.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("JSON payload has no string `message` field")]
    MissingMessageField,
}

/// A single dispatch attempt failed. Logged, never retried here.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    #[error("provider rate limit hit: {0}")]
    RateLimited(String),

    #[error("destination rejected by provider: {0}")]
    InvalidDestination(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl DeliveryError {
    /// Stable label for logs and the per-kind failure counter.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::Auth(_) => "auth",
            DeliveryError::RateLimited(_) => "rate_limited",
            DeliveryError::InvalidDestination(_) => "invalid_destination",
            DeliveryError::ProviderUnavailable(_) => "provider_unavailable",
        }
    }
}
