//! Outreach configuration system.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OutreachError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Dispatch settings applied to new jobs unless the request overrides them.
    #[serde(default)]
    pub defaults: DispatchConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
}

fn default_database_path() -> String { "~/.outreach/outreach.db".into() }

impl Default for OutreachConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            engine: EngineConfig::default(),
            defaults: DispatchConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl OutreachConfig {
    /// Load config from the default path (~/.outreach/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| OutreachError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| OutreachError::Config(format!("Failed to parse config: {e}")))?;
        config.defaults.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| OutreachError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the outreach home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".outreach")
    }

    /// Database path with `~` expanded.
    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }
}

/// Engine runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How often the trigger promotes due scheduled jobs and adopts orphaned
    /// running jobs.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Upper bound on how long any suspension sleeps before re-reading the
    /// job status.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Fixed seed for the pacing RNG (reproducible runs).
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn default_tick_interval() -> u64 { 30 }
fn default_poll_interval() -> u64 { 5000 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            poll_interval_ms: default_poll_interval(),
            rng_seed: None,
        }
    }
}

/// When a job begins dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Immediate,
    Scheduled,
}

/// Longest inter-message delay a job may configure (one day).
pub const MAX_DELAY_SECONDS: u64 = 86_400;
/// Longest periodic rest, in minutes (one day).
pub const MAX_PAUSE_MINUTES: u64 = 1_440;
/// Longest simulated typing time.
pub const MAX_TYPING_SECONDS: u64 = 600;

/// Per-job dispatch settings. Snapshotted into the job at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    // ─── Scheduling window ───
    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_start_hour")]
    pub send_start_hour: u32,
    /// Exclusive. `24` means "until midnight".
    #[serde(default = "default_end_hour")]
    pub send_end_hour: u32,
    /// Weekday numbers, 0 = Sunday … 6 = Saturday.
    #[serde(default = "default_send_days")]
    pub send_days: BTreeSet<u32>,

    // ─── Quotas ───
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_messages_per_hour")]
    pub messages_per_hour: u32,

    // ─── Pacing ───
    #[serde(default = "default_min_delay")]
    pub min_delay_seconds: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    #[serde(default = "default_jitter")]
    pub jitter_percent: u32,
    #[serde(default = "bool_true")]
    pub adaptive_delay: bool,
    #[serde(default = "bool_true")]
    pub typing_simulation: bool,
    #[serde(default = "default_typing_min")]
    pub typing_duration_min: u64,
    #[serde(default = "default_typing_max")]
    pub typing_duration_max: u64,
    #[serde(default = "bool_true")]
    pub random_pause: bool,
    /// Rest after every N sent messages; 0 disables.
    #[serde(default = "default_pause_every")]
    pub pause_every_messages: u32,
    #[serde(default = "default_pause_minutes")]
    pub pause_duration_minutes: u64,

    // ─── Warm-up ───
    #[serde(default)]
    pub warmup_enabled: bool,
    #[serde(default = "default_warmup_day")]
    pub warmup_day: u32,
    #[serde(default = "default_warmup_increment")]
    pub warmup_increment_percent: u32,

    // ─── Safety ───
    #[serde(default = "bool_true")]
    pub stop_on_errors: bool,
    #[serde(default = "default_max_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "bool_true")]
    pub detect_blacklist: bool,
}

fn bool_true() -> bool { true }
fn default_start_hour() -> u32 { 8 }
fn default_end_hour() -> u32 { 20 }
fn default_send_days() -> BTreeSet<u32> { (1..=5).collect() }
fn default_daily_limit() -> u32 { 50 }
fn default_messages_per_hour() -> u32 { 10 }
fn default_min_delay() -> u64 { 45 }
fn default_max_delay() -> u64 { 180 }
fn default_jitter() -> u32 { 20 }
fn default_typing_min() -> u64 { 2 }
fn default_typing_max() -> u64 { 8 }
fn default_pause_every() -> u32 { 10 }
fn default_pause_minutes() -> u64 { 5 }
fn default_warmup_day() -> u32 { 1 }
fn default_warmup_increment() -> u32 { 20 }
fn default_max_errors() -> u32 { 3 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            schedule_type: ScheduleType::Immediate,
            scheduled_at: None,
            send_start_hour: default_start_hour(),
            send_end_hour: default_end_hour(),
            send_days: default_send_days(),
            daily_limit: default_daily_limit(),
            messages_per_hour: default_messages_per_hour(),
            min_delay_seconds: default_min_delay(),
            max_delay_seconds: default_max_delay(),
            jitter_percent: default_jitter(),
            adaptive_delay: true,
            typing_simulation: true,
            typing_duration_min: default_typing_min(),
            typing_duration_max: default_typing_max(),
            random_pause: true,
            pause_every_messages: default_pause_every(),
            pause_duration_minutes: default_pause_minutes(),
            warmup_enabled: false,
            warmup_day: default_warmup_day(),
            warmup_increment_percent: default_warmup_increment(),
            stop_on_errors: true,
            max_consecutive_errors: default_max_errors(),
            detect_blacklist: true,
        }
    }
}

impl DispatchConfig {
    /// Reject settings the dispatcher cannot honor.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(OutreachError::Validation(msg));

        if self.min_delay_seconds > self.max_delay_seconds {
            return invalid(format!(
                "min_delay_seconds ({}) exceeds max_delay_seconds ({})",
                self.min_delay_seconds, self.max_delay_seconds
            ));
        }
        if self.max_delay_seconds > MAX_DELAY_SECONDS {
            return invalid(format!(
                "max_delay_seconds ({}) exceeds {MAX_DELAY_SECONDS}",
                self.max_delay_seconds
            ));
        }
        if self.pause_duration_minutes > MAX_PAUSE_MINUTES {
            return invalid(format!(
                "pause_duration_minutes ({}) exceeds {MAX_PAUSE_MINUTES}",
                self.pause_duration_minutes
            ));
        }
        if self.typing_duration_max > MAX_TYPING_SECONDS {
            return invalid(format!(
                "typing_duration_max ({}) exceeds {MAX_TYPING_SECONDS}",
                self.typing_duration_max
            ));
        }
        if self.jitter_percent > 100 {
            return invalid(format!("jitter_percent must be 0-100, got {}", self.jitter_percent));
        }
        if self.send_start_hour > 23 || self.send_end_hour > 24 {
            return invalid(format!(
                "send hours out of range: {}-{}",
                self.send_start_hour, self.send_end_hour
            ));
        }
        // Windows that wrap past midnight have no agreed semantics yet.
        if self.send_start_hour >= self.send_end_hour {
            return invalid(format!(
                "send window {}:00-{}:00 is empty or wraps past midnight",
                self.send_start_hour, self.send_end_hour
            ));
        }
        if self.send_days.is_empty() {
            return invalid("send_days is empty".into());
        }
        if let Some(day) = self.send_days.iter().find(|d| **d > 6) {
            return invalid(format!("send_days contains {day}, expected 0-6"));
        }
        if self.typing_duration_min > self.typing_duration_max {
            return invalid(format!(
                "typing_duration_min ({}) exceeds typing_duration_max ({})",
                self.typing_duration_min, self.typing_duration_max
            ));
        }
        if self.schedule_type == ScheduleType::Scheduled && self.scheduled_at.is_none() {
            return invalid("schedule_type is scheduled but scheduled_at is missing".into());
        }
        if self.stop_on_errors && self.max_consecutive_errors == 0 {
            return invalid("max_consecutive_errors must be at least 1".into());
        }
        Ok(())
    }

    /// Apply a partial JSON object on top of these settings.
    pub fn overlay(&self, patch: &serde_json::Value) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        if let (Some(base_obj), Some(patch_obj)) = (base.as_object_mut(), patch.as_object()) {
            for (key, value) in patch_obj {
                base_obj.insert(key.clone(), value.clone());
            }
        } else if !patch.is_null() {
            return Err(OutreachError::Validation("config override must be an object".into()));
        }
        Ok(serde_json::from_value(base)?)
    }
}

/// Channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    #[serde(default)]
    pub whatsapp: Vec<WhatsAppChannelConfig>,
    #[serde(default)]
    pub webhook: Vec<WebhookChannelConfig>,
    /// Register a channel that logs instead of sending. For rehearsals.
    #[serde(default)]
    pub dry_run: Option<String>,
}

/// One WhatsApp Business phone number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppChannelConfig {
    /// Channel id jobs refer to.
    pub id: String,
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
}

fn default_graph_version() -> String { "v21.0".into() }

/// Generic HTTP relay: POSTs `{channel_id, to, name, message}` to `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 { 10 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OutreachConfig::default();
        assert_eq!(config.engine.tick_interval_secs, 30);
        assert_eq!(config.defaults.daily_limit, 50);
        assert_eq!(config.defaults.send_days, (1..=5).collect());
        assert!(config.defaults.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            database_path = "/tmp/outreach.db"

            [engine]
            poll_interval_ms = 250

            [defaults]
            daily_limit = 30
            send_days = [1, 3, 5]

            [[channel.whatsapp]]
            id = "wa-main"
            access_token = "token"
            phone_number_id = "1234"
        "#;

        let config: OutreachConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.poll_interval_ms, 250);
        assert_eq!(config.engine.tick_interval_secs, 30);
        assert_eq!(config.defaults.daily_limit, 30);
        assert_eq!(config.defaults.max_delay_seconds, 180);
        assert_eq!(config.channel.whatsapp[0].api_version, "v21.0");
        assert_eq!(config.database_file(), PathBuf::from("/tmp/outreach.db"));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: OutreachConfig = toml::from_str("").unwrap();
        assert_eq!(config.defaults.send_start_hour, 8);
        assert!(config.channel.webhook.is_empty());
    }

    #[test]
    fn test_validate_rejects_overnight_window() {
        let config = DispatchConfig {
            send_start_hour: 22,
            send_end_hour: 6,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(OutreachError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let config = DispatchConfig {
            min_delay_seconds: 200,
            max_delay_seconds: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_waits() {
        let huge_delay = DispatchConfig {
            min_delay_seconds: u64::MAX - 1,
            max_delay_seconds: u64::MAX,
            ..Default::default()
        };
        assert!(huge_delay.validate().is_err());

        let long_rest = DispatchConfig {
            pause_duration_minutes: u64::MAX,
            ..Default::default()
        };
        assert!(long_rest.validate().is_err());

        let long_typing = DispatchConfig {
            typing_duration_max: MAX_TYPING_SECONDS + 1,
            ..Default::default()
        };
        assert!(long_typing.validate().is_err());

        let at_limits = DispatchConfig {
            min_delay_seconds: MAX_DELAY_SECONDS,
            max_delay_seconds: MAX_DELAY_SECONDS,
            pause_duration_minutes: MAX_PAUSE_MINUTES,
            typing_duration_max: MAX_TYPING_SECONDS,
            ..Default::default()
        };
        assert!(at_limits.validate().is_ok());
    }

    #[test]
    fn test_validate_scheduled_requires_timestamp() {
        let mut config = DispatchConfig {
            schedule_type: ScheduleType::Scheduled,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.scheduled_at = Some(Utc::now());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlay_partial_object() {
        let base = DispatchConfig::default();
        let patched = base
            .overlay(&serde_json::json!({"daily_limit": 5, "jitter_percent": 0}))
            .unwrap();
        assert_eq!(patched.daily_limit, 5);
        assert_eq!(patched.jitter_percent, 0);
        assert_eq!(patched.max_delay_seconds, base.max_delay_seconds);

        assert_eq!(base.overlay(&serde_json::Value::Null).unwrap(), base);
        assert!(base.overlay(&serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = OutreachConfig::home_dir();
        assert!(home.to_string_lossy().contains("outreach"));
    }
}
