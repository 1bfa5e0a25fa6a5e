//! Collaborator seams consumed by the dispatcher.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{SendOutcome, Target};

/// A messaging backend able to deliver one rendered message.
///
/// `Ok(SendOutcome::Failed(..))` and `Err(..)` are both treated as a failed
/// attempt by the dispatcher; `Err` is reserved for transport-level problems
/// (timeouts, unknown channel, bad credentials).
#[async_trait]
pub trait SendChannel: Send + Sync {
    /// Backend name, used in logs.
    fn name(&self) -> &str;

    /// Deliver `target.message` to `target.id` through the channel identified
    /// by `channel_id`.
    async fn send(&self, channel_id: &str, target: &Target) -> Result<SendOutcome>;
}
