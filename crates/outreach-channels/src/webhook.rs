//! Generic HTTP relay channel.
//!
//! POSTs each message as JSON to a configured URL. The relay answers with an
//! optional `{"status": "delivered" | "failed" | "blocked", "reason": ".."}`
//! body; HTTP 403/410 are read as a blocked recipient.

use async_trait::async_trait;
use outreach_core::config::WebhookChannelConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::SendChannel;
use outreach_core::types::{SendOutcome, Target};

pub struct WebhookChannel {
    config: WebhookChannelConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookChannelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.config.id
    }
}

/// Read the relay's verdict from status code + body.
pub fn classify_response(status: u16, body: &serde_json::Value) -> SendOutcome {
    let reason = body["reason"].as_str().unwrap_or_default().to_string();

    if status == 403 || status == 410 {
        let reason = if reason.is_empty() { format!("HTTP {status}") } else { reason };
        return SendOutcome::Blocked(reason);
    }
    if !(200..300).contains(&status) {
        let reason = if reason.is_empty() { format!("HTTP {status}") } else { reason };
        return SendOutcome::Failed(reason);
    }

    match body["status"].as_str() {
        Some("blocked") => SendOutcome::Blocked(reason),
        Some("failed") => SendOutcome::Failed(if reason.is_empty() {
            "relay reported failure".into()
        } else {
            reason
        }),
        _ => SendOutcome::Delivered,
    }
}

#[async_trait]
impl SendChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, channel_id: &str, target: &Target) -> Result<SendOutcome> {
        let mut req = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({
                "channel_id": channel_id,
                "to": target.id,
                "name": target.display_name,
                "message": target.message,
            }))
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs));

        for (key, value) in &self.config.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| OutreachError::Http(format!("Webhook send failed: {e}")))?;

        let status = resp.status().as_u16();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let outcome = classify_response(status, &body);
        tracing::debug!("Webhook {} → {}: {:?}", self.config.url, target.id, outcome);
        Ok(outcome)
    }
}
