//! Pacing engine — how long to wait before the next send.
//!
//! Pure apart from its RNG: uniform base delay, multiplicative jitter,
//! adaptive back-off after failures, and periodic long rests.

use std::time::Duration;

use outreach_core::config::DispatchConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Back-off multiplier ceiling.
const MAX_ESCALATION: f64 = 5.0;

/// Length of one periodic rest.
pub fn rest_duration(config: &DispatchConfig) -> Duration {
    Duration::from_secs(config.pause_duration_minutes.saturating_mul(60))
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

/// Adaptive back-off multiplier: 1.5× after one failure, 2× after two, …
pub fn escalation_factor(consecutive_failures: u32) -> f64 {
    (1.0 + 0.5 * f64::from(consecutive_failures)).min(MAX_ESCALATION)
}

/// Inputs describing where the job stands.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacingStep {
    /// Messages sent so far in this job.
    pub sent_count: u32,
    /// Current failure streak (0 after a success).
    pub consecutive_failures: u32,
    /// `sent_count` at which the last long rest was taken.
    pub last_rest_at: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PacingDecision {
    /// Regular inter-message delay.
    Delay(Duration),
    /// One-off long rest replacing the delay for this step.
    Rest(Duration),
}

impl PacingDecision {
    pub fn duration(&self) -> Duration {
        match self {
            PacingDecision::Delay(d) | PacingDecision::Rest(d) => *d,
        }
    }

    pub fn is_rest(&self) -> bool {
        matches!(self, PacingDecision::Rest(_))
    }
}

pub struct PacingEngine<R: Rng = StdRng> {
    rng: R,
}

impl PacingEngine<StdRng> {
    /// Seeded for reproducible runs, entropy-seeded otherwise.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl<R: Rng> PacingEngine<R> {
    fn rest_due(config: &DispatchConfig, step: &PacingStep) -> bool {
        config.random_pause
            && config.pause_every_messages > 0
            && step.sent_count > 0
            && step.sent_count % config.pause_every_messages == 0
            && step.last_rest_at != Some(step.sent_count)
    }

    /// Wait before the next send.
    pub fn next_delay(&mut self, config: &DispatchConfig, step: &PacingStep) -> PacingDecision {
        if Self::rest_due(config, step) {
            return PacingDecision::Rest(rest_duration(config));
        }

        let min = config.min_delay_seconds as f64;
        let max = config.max_delay_seconds.max(config.min_delay_seconds) as f64;
        let mut secs = self.rng.gen_range(min..=max);

        if config.jitter_percent > 0 {
            let spread = f64::from(config.jitter_percent.min(100)) / 100.0;
            secs *= self.rng.gen_range((1.0 - spread)..=(1.0 + spread));
        }

        if config.adaptive_delay && step.consecutive_failures > 0 {
            secs *= escalation_factor(step.consecutive_failures);
        }

        PacingDecision::Delay(secs_to_duration(secs))
    }

    /// Simulated typing time right before the send call, if enabled.
    pub fn typing_delay(&mut self, config: &DispatchConfig) -> Option<Duration> {
        if !config.typing_simulation {
            return None;
        }
        let min = config.typing_duration_min;
        let max = config.typing_duration_max.max(min);
        Some(Duration::from_secs(self.rng.gen_range(min..=max)))
    }
}
