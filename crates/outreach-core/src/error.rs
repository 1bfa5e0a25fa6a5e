//! Error taxonomy shared by every outreach crate.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OutreachError>;

#[derive(Debug, Error)]
pub enum OutreachError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid transition: {from} → {to}")]
    InvalidTransition { from: String, to: String },

    /// Deletion requested for a job that has not reached a terminal state.
    #[error("Job {0} is still active")]
    JobActive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl OutreachError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
