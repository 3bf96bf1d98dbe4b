#![allow(dead_code)]
pub mod fake_dispatcher;
pub mod mock_transport;

use sparkrelay::config::Config;

/// A fully populated configuration with every outward-facing piece
/// switched off: no liveness listener, no reconnect, mock-only endpoint.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.broker.endpoint = "wss://127.0.0.1:1".to_string();
    config.broker.username = "user".to_string();
    config.broker.password = "pass".to_string();
    config.broker.client_id = "uid2".to_string();
    config.broker.topic = "userTopic".to_string();
    config.broker.reconnect = false;
    config.broker.handshake_timeout_ms = 1_000;
    config.sms.account_sid = "AC123".to_string();
    config.sms.auth_token = "token".to_string();
    config.sms.from_number = "+15550002".to_string();
    config.sms.to_number = "+15550001".to_string();
    config.http.enabled = false;
    config
}
