//! A client for sending SMS alerts through a Twilio-compatible API.

use crate::config::SmsConfig;
use crate::core::{AlertDispatcher, AlertRequest, DeliveryReceipt, DeliveryResult};
use crate::errors::DeliveryError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Error codes the provider uses for an unusable destination number.
const INVALID_DESTINATION_CODES: &[u64] = &[21211, 21604, 21614];

#[derive(Deserialize)]
struct MessageResponse {
    sid: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    code: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

/// Sends one SMS per [`send`](AlertDispatcher::send) call against the
/// provider's Messages API. The base URL is configurable so tests can
/// point the client at a local mock server.
pub struct SmsClient {
    http: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
}

impl SmsClient {
    /// Creates a new `SmsClient` from the provider configuration.
    pub fn new(config: &SmsConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_base, self.account_sid
        )
    }

    fn map_failure(status: StatusCode, body: &str) -> DeliveryError {
        let detail: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
        let reason = detail
            .message
            .unwrap_or_else(|| format!("status {}", status));

        match status.as_u16() {
            401 | 403 => DeliveryError::Auth(reason),
            429 => DeliveryError::RateLimited(reason),
            400..=499 => {
                if detail.code.is_some_and(|c| INVALID_DESTINATION_CODES.contains(&c)) {
                    DeliveryError::InvalidDestination(reason)
                } else {
                    DeliveryError::ProviderUnavailable(reason)
                }
            }
            _ => DeliveryError::ProviderUnavailable(reason),
        }
    }
}

#[async_trait]
impl AlertDispatcher for SmsClient {
    fn name(&self) -> &str {
        "sms"
    }

    /// Makes exactly one Messages API call for the request. Never retries;
    /// the outcome is the caller's to log.
    #[instrument(skip(self, request), fields(to = %request.to))]
    async fn send(&self, request: &AlertRequest) -> DeliveryResult {
        let params = [
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Body", request.body.as_str()),
        ];

        let response = self
            .http
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "SMS provider request failed");
                DeliveryError::ProviderUnavailable(e.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            let body: MessageResponse = response.json().await.map_err(|e| {
                DeliveryError::ProviderUnavailable(format!("malformed provider response: {}", e))
            })?;
            info!(provider_id = %body.sid, "SMS accepted by provider");
            Ok(DeliveryReceipt {
                provider_id: body.sid,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            let err = Self::map_failure(status, &body);
            error!(status = %status, kind = err.kind(), "SMS provider rejected dispatch");
            Err(err)
        }
    }
}
