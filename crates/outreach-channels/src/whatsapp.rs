//! WhatsApp Business Cloud API channel.
//!
//! Uses the official WhatsApp Business Platform (Cloud API) for outbound text.
//! Requires: Access Token + Phone Number ID from Meta Business Suite.

use async_trait::async_trait;
use outreach_core::config::WhatsAppChannelConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::SendChannel;
use outreach_core::types::{SendOutcome, Target};

const GRAPH_BASE_URL: &str = "https://graph.facebook.com";

/// Graph API error codes meaning the recipient cannot be reached by us at all.
/// 131026: undeliverable (not on WhatsApp / blocked the business).
/// 131050: user stopped marketing messages.
const BLOCKED_ERROR_CODES: &[i64] = &[131026, 131050];

/// WhatsApp Business channel bound to one phone number.
pub struct WhatsAppChannel {
    config: WhatsAppChannelConfig,
    client: reqwest::Client,
    base_url: String,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppChannelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            base_url: GRAPH_BASE_URL.into(),
        }
    }

    /// Point the channel at a different Graph API host (sandbox, proxy).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.config.id
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.base_url.trim_end_matches('/'),
            self.config.api_version,
            self.config.phone_number_id
        )
    }

    /// Send a text message via WhatsApp Cloud API.
    async fn send_text_message(&self, to: &str, text: &str) -> Result<SendOutcome> {
        if self.config.access_token.is_empty() {
            return Err(OutreachError::Config(
                "WhatsApp access_token not configured".into(),
            ));
        }

        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text
            }
        });

        let response = self
            .client
            .post(self.messages_url())
            .header("Authorization", format!("Bearer {}", self.config.access_token))
            .json(&body)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| OutreachError::Http(format!("WhatsApp API request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response.json().await.unwrap_or_default();

        if !status.is_success() {
            return Ok(classify_error(status.as_u16(), &payload));
        }

        let msg_id = payload["messages"][0]["id"].as_str().unwrap_or("unknown");
        tracing::debug!("WhatsApp message sent: {} → {}", msg_id, to);
        Ok(SendOutcome::Delivered)
    }
}

/// Map a Graph API error response to a send outcome.
pub fn classify_error(status: u16, payload: &serde_json::Value) -> SendOutcome {
    let error = &payload["error"];
    let code = error["code"].as_i64().unwrap_or_default();
    let message = error["message"].as_str().unwrap_or("unknown error");

    if BLOCKED_ERROR_CODES.contains(&code) {
        SendOutcome::Blocked(format!("WhatsApp {code}: {message}"))
    } else {
        SendOutcome::Failed(format!("WhatsApp API error {status} ({code}): {message}"))
    }
}

#[async_trait]
impl SendChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(&self, channel_id: &str, target: &Target) -> Result<SendOutcome> {
        if channel_id != self.config.id {
            return Err(OutreachError::Channel(format!(
                "WhatsApp channel '{}' asked to send for '{channel_id}'",
                self.config.id
            )));
        }
        self.send_text_message(&target.id, &target.message).await
    }
}
