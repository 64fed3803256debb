//! Retry policy for outbox delivery.
//!
//! Computes the state an attempted entry moves to: delivered, failed after
//! `max_attempts`, or pending again with exponential backoff plus jitter.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::defaults::{RETRY_BASE_DELAY_SECS, RETRY_JITTER_RATIO, RETRY_MAX_DELAY_SECS};
use crate::models::{EntryTransition, OutboxEntry, OutboxStatus};

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
    /// Jitter upper bound as a fraction of the capped delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: RETRY_BASE_DELAY_SECS,
            max_delay_secs: RETRY_MAX_DELAY_SECS,
            jitter_ratio: RETRY_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Backoff without jitter for the given (already incremented) attempt count.
    ///
    /// `min(base * 2^(attempts-1), max)`; attempts below 1 are treated as 1.
    pub fn base_delay(&self, attempts: i32) -> i64 {
        let exponent = (attempts.max(1) - 1).min(32) as u32;
        self.base_delay_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_delay_secs)
    }

    /// Largest jitter that may be added to `delay_secs`.
    pub fn max_jitter(&self, delay_secs: i64) -> i64 {
        (delay_secs as f64 * self.jitter_ratio).floor() as i64
    }

    /// Backoff with a random jitter in `0..=max_jitter`.
    pub fn delay(&self, attempts: i32) -> Duration {
        let delay = self.base_delay(attempts);
        let jitter = match self.max_jitter(delay) {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        Duration::seconds(delay + jitter)
    }

    /// Transition for one attempted entry.
    ///
    /// `error` is `None` on success; otherwise the joined per-endpoint errors.
    pub fn transition(
        &self,
        entry: &OutboxEntry,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> EntryTransition {
        let attempts = entry.attempts + 1;

        match error {
            None => EntryTransition {
                id: entry.id,
                previous_attempts: entry.attempts,
                attempts,
                status: OutboxStatus::Delivered,
                next_attempt_at: None,
                delivered_at: Some(now),
                error_message: String::new(),
            },
            Some(error_message) if attempts >= entry.max_attempts => EntryTransition {
                id: entry.id,
                previous_attempts: entry.attempts,
                attempts,
                status: OutboxStatus::Failed,
                next_attempt_at: None,
                delivered_at: None,
                error_message,
            },
            Some(error_message) => EntryTransition {
                id: entry.id,
                previous_attempts: entry.attempts,
                attempts,
                status: OutboxStatus::Pending,
                next_attempt_at: Some(now + self.delay(attempts)),
                delivered_at: None,
                error_message,
            },
        }
    }
}
