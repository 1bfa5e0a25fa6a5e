//! Dry-run channel — logs every message and reports it delivered.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use outreach_core::error::Result;
use outreach_core::traits::SendChannel;
use outreach_core::types::{SendOutcome, Target};

#[derive(Default)]
pub struct DryRunChannel {
    sent: AtomicU64,
}

impl DryRunChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages "sent" so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SendChannel for DryRunChannel {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn send(&self, channel_id: &str, target: &Target) -> Result<SendOutcome> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let preview: String = target.message.chars().take(80).collect();
        tracing::info!(
            "🧪 [dry-run:{}] → {} ({}): {}",
            channel_id,
            target.id,
            target.display_name,
            preview
        );
        Ok(SendOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_sends() {
        let channel = DryRunChannel::new();
        let target = Target::new("1", "Bao", "xin chào");
        assert_eq!(channel.send("dry", &target).await.unwrap(), SendOutcome::Delivered);
        assert_eq!(channel.send("dry", &target).await.unwrap(), SendOutcome::Delivered);
        assert_eq!(channel.sent(), 2);
    }
}
