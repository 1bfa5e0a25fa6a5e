//! # Outreach Core
//!
//! Shared building blocks for the outreach dispatcher:
//! - `config` — TOML configuration, including the per-job `DispatchConfig`
//! - `error` — the `OutreachError` taxonomy
//! - `types` — targets and send outcomes
//! - `traits` — the `SendChannel` seam implemented by messaging backends

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::{DispatchConfig, OutreachConfig, ScheduleType};
pub use error::{OutreachError, Result};
pub use traits::SendChannel;
pub use types::{SendOutcome, Target};
