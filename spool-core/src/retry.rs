use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff for chunk upload retries.
///
/// `retry_count` is the number of retries already scheduled for a task, so the
/// first retry waits `base_delay`, the second `2 * base_delay`, and so on up to
/// `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Adds up to `base_delay / 2` of random delay, never past `max_delay`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// `min(base * 2^(retry_count - 1), max)`, plus jitter when enabled.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let capped = self.capped_delay(retry_count);
        if !self.jitter {
            return capped;
        }

        let jitter_range = self.base_delay_ms / 2;
        let headroom = u64::try_from(self.max_delay().saturating_sub(capped).as_millis())
            .unwrap_or(u64::MAX);
        let limit = jitter_range.min(headroom);
        if limit == 0 {
            return capped;
        }
        let extra = rand::rng().random_range(0..limit);
        (capped + Duration::from_millis(extra)).min(self.max_delay())
    }

    fn capped_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1);
        // Shifts past 63 saturate instead of wrapping.
        let multiplier = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Every delay a chunk would wait if all of its attempts failed.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_retries).map(|r| self.capped_delay(r)).collect()
    }
}
