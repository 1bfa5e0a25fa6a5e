//! Channel registry — routes a job's `channel_id` to its backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use outreach_core::config::ChannelConfig;
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::SendChannel;
use outreach_core::types::{SendOutcome, Target};

use crate::dry_run::DryRunChannel;
use crate::webhook::WebhookChannel;
use crate::whatsapp::WhatsAppChannel;

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn SendChannel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every channel declared in config.
    pub fn from_config(config: &ChannelConfig) -> Self {
        let mut registry = Self::new();
        for wa in &config.whatsapp {
            registry.register(&wa.id, Arc::new(WhatsAppChannel::new(wa.clone())));
        }
        for wh in &config.webhook {
            registry.register(&wh.id, Arc::new(WebhookChannel::new(wh.clone())));
        }
        if let Some(id) = &config.dry_run {
            registry.register(id, Arc::new(DryRunChannel::new()));
        }
        registry
    }

    /// Register (or replace) the backend for a channel id.
    pub fn register(&mut self, channel_id: &str, channel: Arc<dyn SendChannel>) {
        tracing::info!("📡 Channel registered: {} ({})", channel_id, channel.name());
        self.channels.insert(channel_id.to_string(), channel);
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.channels.contains_key(channel_id)
    }

    /// Registered channel ids, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SendChannel for ChannelRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn send(&self, channel_id: &str, target: &Target) -> Result<SendOutcome> {
        let channel = self
            .channels
            .get(channel_id)
            .ok_or_else(|| OutreachError::Channel(format!("Unknown channel: {channel_id}")))?;
        channel.send(channel_id, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_core::config::WebhookChannelConfig;

    #[test]
    fn test_from_config() {
        let config = ChannelConfig {
            whatsapp: vec![],
            webhook: vec![WebhookChannelConfig {
                id: "relay".into(),
                url: "http://localhost:1/send".into(),
                headers: Default::default(),
                timeout_secs: 5,
            }],
            dry_run: Some("rehearsal".into()),
        };
        let registry = ChannelRegistry::from_config(&config);
        assert_eq!(registry.channel_ids(), vec!["rehearsal", "relay"]);
    }

    #[tokio::test]
    async fn test_routes_by_channel_id() {
        let mut registry = ChannelRegistry::new();
        registry.register("dry", Arc::new(DryRunChannel::new()));
        let target = Target::new("1", "Chi", "hi");

        assert!(registry.send("dry", &target).await.unwrap().is_delivered());
        let err = registry.send("missing", &target).await.unwrap_err();
        assert!(matches!(err, OutreachError::Channel(_)));
    }
}
