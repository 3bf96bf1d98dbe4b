//! Configuration management for sparkrelay.
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer a `sparkrelay.toml` file, `SPARKRELAY_*` environment
//! variables, and command-line arguments over the built-in defaults.
//!
//! Broker credentials and provider secrets are expected to arrive through
//! the environment in deployments (e.g. `SPARKRELAY_BROKER__PASSWORD`).

use crate::cli::Cli;
use crate::errors::ConfigError;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The logging level filter for the application.
    pub log_level: String,
    /// Configuration for the broker session.
    pub broker: BrokerConfig,
    /// Configuration for the SMS provider.
    pub sms: SmsConfig,
    /// Configuration for outbound dispatch behavior.
    pub dispatch: DispatchConfig,
    /// Configuration for the liveness/metrics listener.
    pub http: HttpConfig,
}

/// Connection parameters for the message broker.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BrokerConfig {
    /// WebSocket endpoint of the broker (e.g. `wss://broker.example:443`).
    pub endpoint: String,
    /// Broker username.
    pub username: String,
    /// Broker password.
    pub password: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// The single topic this relay subscribes to.
    pub topic: String,
    /// How long to wait for the broker to acknowledge connect/subscribe.
    pub handshake_timeout_ms: u64,
    /// Whether to accept invalid TLS certificates (for test brokers).
    pub allow_invalid_certs: bool,
    /// Whether to re-dial after an unsolicited connection loss.
    pub reconnect: bool,
    /// Initial reconnect backoff in milliseconds.
    pub reconnect_initial_backoff_ms: u64,
    /// Upper bound on the reconnect backoff in milliseconds.
    pub reconnect_max_backoff_ms: u64,
}

/// Parameters for the Twilio-compatible SMS provider.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SmsConfig {
    /// Base URL of the provider API. Overridable so tests can point at a
    /// local mock server.
    pub api_base: String,
    /// Provider account identifier.
    pub account_sid: String,
    /// Provider auth token.
    pub auth_token: String,
    /// Sender identifier registered with the provider.
    pub from_number: String,
    /// Destination identifier for relayed alerts.
    pub to_number: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

/// Outbound dispatch behavior.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DispatchConfig {
    /// Whether parsed alerts are actually forwarded to the provider. When
    /// disabled the relay parses and logs but never calls out.
    pub enabled: bool,
    /// Maximum number of concurrently in-flight dispatches.
    pub max_in_flight: usize,
}

/// The liveness/metrics HTTP listener.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    /// Whether to run the listener at all.
    pub enabled: bool,
    /// Address to bind. Defaults to port 3000.
    pub listen_address: SocketAddr,
}

impl Config {
    /// Loads the configuration by layering sources: defaults, TOML file,
    /// environment variables, and command-line arguments.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| "sparkrelay.toml".into());

        let mut figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // Nested keys use double underscores, e.g. SPARKRELAY_BROKER__TOPIC.
            .merge(Env::prefixed("SPARKRELAY_").split("__"));

        if let Some(endpoint) = &cli.endpoint {
            figment = figment.merge(Serialized::default("broker.endpoint", endpoint));
        }
        if let Some(topic) = &cli.topic {
            figment = figment.merge(Serialized::default("broker.topic", topic));
        }
        // `--dry-run` only ever disables dispatch; its absence must not
        // override a `dispatch.enabled = false` from the file.
        if cli.dry_run {
            figment = figment.merge(Serialized::default("dispatch.enabled", false));
        }

        let config: Config = figment.extract()?;
        Ok(config)
    }

    /// Checks that every value required to reach the broker (and, when
    /// dispatch is enabled, the provider) is present. Called before any
    /// connection attempt; a failure here is startup-fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(key: &'static str, value: &str) -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                Err(ConfigError::Missing(key))
            } else {
                Ok(())
            }
        }

        require("broker.endpoint", &self.broker.endpoint)?;
        require("broker.username", &self.broker.username)?;
        require("broker.password", &self.broker.password)?;
        require("broker.client_id", &self.broker.client_id)?;
        require("broker.topic", &self.broker.topic)?;

        if self.dispatch.enabled {
            require("sms.api_base", &self.sms.api_base)?;
            require("sms.account_sid", &self.sms.account_sid)?;
            require("sms.auth_token", &self.sms.auth_token)?;
            require("sms.from_number", &self.sms.from_number)?;
            require("sms.to_number", &self.sms.to_number)?;
        }

        if self.dispatch.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.max_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerConfig {
                endpoint: String::new(),
                username: String::new(),
                password: String::new(),
                client_id: "sparkrelay".to_string(),
                topic: "userTopic".to_string(),
                handshake_timeout_ms: 10_000,
                allow_invalid_certs: false,
                reconnect: true,
                reconnect_initial_backoff_ms: 1_000,
                reconnect_max_backoff_ms: 60_000,
            },
            sms: SmsConfig {
                api_base: "https://api.twilio.com".to_string(),
                account_sid: String::new(),
                auth_token: String::new(),
                from_number: String::new(),
                to_number: String::new(),
                request_timeout_secs: 10,
            },
            dispatch: DispatchConfig {
                enabled: true,
                max_in_flight: 32,
            },
            http: HttpConfig {
                enabled: true,
                listen_address: "0.0.0.0:3000".parse().expect("static address"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Config {
        let mut config = Config::default();
        config.broker.endpoint = "wss://broker.example:443".to_string();
        config.broker.username = "solace-user".to_string();
        config.broker.password = "secret".to_string();
        config.sms.account_sid = "AC123".to_string();
        config.sms.auth_token = "token".to_string();
        config.sms.from_number = "+15550002".to_string();
        config.sms.to_number = "+15550001".to_string();
        config
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(populated().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_broker_values() {
        let mut config = populated();
        config.broker.password = String::new();
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::Missing("broker.password")
        );
    }

    #[test]
    fn test_validate_skips_sms_checks_when_dispatch_disabled() {
        let mut config = populated();
        config.dispatch.enabled = false;
        config.sms.account_sid = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = populated();
        config.dispatch.max_in_flight = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::Invalid { key: "dispatch.max_in_flight", .. }
        ));
    }
}
