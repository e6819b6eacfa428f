//! Exponential backoff for failed migrations.
//!
//! Retries are not driven by a sleeping loop: a failed task stores a
//! `not_before` timestamp computed here and the dispatcher re-arms it once
//! the time has passed, so backoff survives restarts.

use crate::config::MigrationSettings;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Backoff schedule for migration retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Attempts allowed before a task is exhausted.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exponential base (2.0 doubles the delay each attempt).
    pub exponential_base: f64,
    /// Randomize delays by a factor in 0.5..1.5.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&MigrationSettings::default())
    }
}

impl BackoffPolicy {
    pub fn from_settings(settings: &MigrationSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_secs(settings.backoff_base_secs),
            max_delay: Duration::from_secs(settings.backoff_max_secs),
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Delay after the given number of failed attempts (1-based).
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Earliest time a task that has failed `attempts` times may run again.
    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.calculate_delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }

    /// True when `attempts` failures use up the attempt budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
