//! Retry and backoff primitives shared by the executors

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay between attempts
    Fixed,
    /// Base-2 exponential delay: `base * 2^attempt`
    Exponential,
}

/// Retry budget with a backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed beyond the first
    pub max_retries: u32,
    /// Base delay between attempts
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Backoff strategy
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Constant-delay policy
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Base-2 exponential policy
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before the retry following the given zero-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(crate::constants::DEFAULT_MAX_RETRIES, crate::constants::DEFAULT_RETRY_DELAY)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
