//! HTTP webhook transport.
//!
//! Posts the JSON delivery body of each event to the configured url, or to a
//! per-event sub-path when the destination routes by event. Failures come back
//! as [`WebhookDeliveryError`] with a stable reason code; the adapter worker logs
//! them and moves on.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;

use crate::channel_adapter::{ChannelDelivery, ChannelTransport};
use crate::channel_config::ChannelDestination;

const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTransportConfig {
    pub http_timeout_ms: u64,
    pub default_headers: BTreeMap<String, String>,
}

impl Default for WebhookTransportConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
            default_headers: BTreeMap::new(),
        }
    }
}

impl WebhookTransportConfig {
    /// Build config from `RELAY_WEBHOOK_TIMEOUT_MS`, falling back to the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_timeout_ms = lookup("RELAY_WEBHOOK_TIMEOUT_MS")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS);
        Self {
            http_timeout_ms,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Structured webhook delivery failure.
pub struct WebhookDeliveryError {
    pub reason_code: &'static str,
    pub detail: String,
    pub retryable: bool,
    pub endpoint: String,
    pub http_status: Option<u16>,
}

impl std::fmt::Display for WebhookDeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reason_code={} retryable={} endpoint={} detail={}",
            self.reason_code, self.retryable, self.endpoint, self.detail
        )
    }
}

impl std::error::Error for WebhookDeliveryError {}

#[derive(Debug, Clone)]
pub struct WebhookTransport {
    config: WebhookTransportConfig,
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(config: WebhookTransportConfig) -> Result<Self> {
        if config.http_timeout_ms == 0 {
            return Err(anyhow!("webhook transport requires http timeout > 0"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ChannelTransport for WebhookTransport {
    async fn send(&self, delivery: &ChannelDelivery) -> Result<()> {
        let ChannelDestination::Webhook(webhook) = &delivery.destination else {
            return Err(WebhookDeliveryError {
                reason_code: "webhook_destination_mismatch",
                detail: format!("cannot deliver to a {} destination", delivery.kind),
                retryable: false,
                endpoint: String::new(),
                http_status: None,
            }
            .into());
        };
        let endpoint = webhook.url_for(delivery.envelope.event);
        let mut body = delivery.envelope.to_delivery_body(Some(endpoint.as_str()));
        if webhook.base64 {
            if let Some(fields) = body.as_object_mut() {
                fields.insert("base64".to_string(), true.into());
            }
        }

        let mut request = self.client.post(endpoint.as_str());
        for (header, value) in self.config.default_headers.iter().chain(webhook.headers.iter()) {
            request = request.header(header.as_str(), value.as_str());
        }
        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|error| WebhookDeliveryError {
                reason_code: "webhook_transport_error",
                detail: error.to_string(),
                retryable: true,
                endpoint: endpoint.clone(),
                http_status: None,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        let (reason_code, retryable) = classify_webhook_status(status);
        Err(WebhookDeliveryError {
            reason_code,
            detail: truncate_detail(&detail),
            retryable,
            endpoint,
            http_status: Some(status.as_u16()),
        }
        .into())
    }
}

fn classify_webhook_status(status: StatusCode) -> (&'static str, bool) {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ("webhook_rate_limited", true);
    }
    if status.is_server_error() {
        return ("webhook_server_error", true);
    }
    ("webhook_rejected", false)
}

fn truncate_detail(raw: &str) -> String {
    const LIMIT: usize = 512;
    let trimmed = raw.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let mut output: String = trimmed.chars().take(LIMIT).collect();
    output.push_str("...");
    output
}
