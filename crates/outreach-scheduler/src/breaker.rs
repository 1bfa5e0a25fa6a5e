//! Circuit breaker — halts a job after too many consecutive failed sends.
//!
//! Only `failed` outcomes count. A `sent` outcome resets the streak;
//! `skipped` (blocked recipient) neither counts nor resets.

use outreach_core::config::DispatchConfig;

use crate::job::{LogEntry, LogStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Tripped,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    enabled: bool,
    threshold: u32,
    consecutive: u32,
}

impl CircuitBreaker {
    pub fn new(enabled: bool, threshold: u32) -> Self {
        Self {
            enabled,
            threshold,
            consecutive: 0,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.stop_on_errors, config.max_consecutive_errors)
    }

    /// Rebuild the streak from a job's existing log (resume after pause or restart).
    pub fn from_history(config: &DispatchConfig, log: &[LogEntry]) -> Self {
        let mut breaker = Self::from_config(config);
        breaker.consecutive = log
            .iter()
            .rev()
            .filter(|e| e.status != LogStatus::Skipped)
            .take_while(|e| e.status == LogStatus::Failed)
            .count() as u32;
        breaker
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn state(&self) -> BreakerState {
        if self.enabled && self.consecutive >= self.threshold {
            BreakerState::Tripped
        } else {
            BreakerState::Closed
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) -> BreakerState {
        self.consecutive += 1;
        self.state()
    }
}
