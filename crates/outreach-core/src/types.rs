//! Message targets and send outcomes.

use serde::{Deserialize, Serialize};

/// One recipient/message pair to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Recipient identifier on the messaging channel (phone number, chat id...).
    pub id: String,
    /// Human-readable name, copied into log entries.
    #[serde(default)]
    pub display_name: String,
    /// Fully rendered message body.
    pub message: String,
}

impl Target {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            message: message.into(),
        }
    }
}

/// What a send channel reports back for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum SendOutcome {
    Delivered,
    Failed(String),
    /// The recipient is unreachable for policy reasons (blocked us, opted out,
    /// not registered on the network).
    Blocked(String),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serde_shape() {
        let json = serde_json::to_value(SendOutcome::Blocked("opted out".into())).unwrap();
        assert_eq!(json["outcome"], "blocked");
        assert_eq!(json["reason"], "opted out");

        let delivered: SendOutcome = serde_json::from_str(r#"{"outcome":"delivered"}"#).unwrap();
        assert!(delivered.is_delivered());
    }

    #[test]
    fn test_target_display_name_optional() {
        let t: Target = serde_json::from_str(r#"{"id":"84901","message":"hi"}"#).unwrap();
        assert_eq!(t.display_name, "");
        assert_eq!(t.id, "84901");
    }
}
