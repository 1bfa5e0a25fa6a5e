//! # Outreach Channels
//! Send collaborators the dispatcher talks to.
//!
//! Every backend implements `outreach_core::SendChannel`; the
//! `ChannelRegistry` routes a job's `channel_id` to the right backend.

pub mod dry_run;
pub mod registry;
pub mod webhook;
pub mod whatsapp;

pub use dry_run::DryRunChannel;
pub use registry::ChannelRegistry;
pub use webhook::WebhookChannel;
pub use whatsapp::WhatsAppChannel;
