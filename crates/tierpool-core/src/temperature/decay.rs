//! Exponentially decayed access score.
//!
//! Each access at time `t` contributes `exp(-λ (now - t))` with
//! `λ = ln 2 / half_life`. Scores are stored incrementally together with the
//! time they were last brought up to date.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayModel {
    lambda: f64,
}

impl DecayModel {
    pub fn new(half_life: Duration) -> Self {
        let secs = half_life.as_secs_f64().max(1.0);
        Self {
            lambda: std::f64::consts::LN_2 / secs,
        }
    }

    /// Weight remaining after `elapsed_secs`. Negative spans count as zero.
    pub fn factor(&self, elapsed_secs: i64) -> f64 {
        (-self.lambda * elapsed_secs.max(0) as f64).exp()
    }

    /// Fold one access at `at` into a score last updated at `scored_at`.
    ///
    /// Returns the new score and its timestamp. An access older than
    /// `scored_at` is added with its own decay instead of rewinding the score.
    pub fn record_access(&self, score: f64, scored_at: i64, at: i64) -> (f64, i64) {
        let updated_at = scored_at.max(at);
        let carried = score * self.factor(updated_at - scored_at);
        (carried + self.factor(updated_at - at), updated_at)
    }

    /// Value of a stored score at `now`.
    pub fn value_at(&self, score: f64, scored_at: i64, now: i64) -> f64 {
        score * self.factor(now - scored_at)
    }
}
