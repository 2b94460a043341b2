//! Backoff between failed attempts

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on any single delay unless configured otherwise
const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How the delay grows with the retry count
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// n-th retry waits n × initial interval
    Linear,
    /// n-th retry waits initial interval × coefficient^(n-1)
    Exponential,
}

/// Delay before a failed task becomes claimable again
///
/// # Example
///
/// ```
/// use accessory::queue::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::linear(Duration::from_secs(10));
///
/// assert_eq!(policy.delay_for(1), Duration::from_secs(10));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,

    /// Delay after the first failure
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Upper bound for any single delay
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor for exponential backoff
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(10))
    }
}

impl BackoffPolicy {
    /// n-th retry after n × `interval`, without jitter
    pub fn linear(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            initial_interval: interval,
            max_interval: MAX_DELAY,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Doubling delays from `interval`, capped at one hour, with 10% jitter
    pub fn exponential(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_interval: interval,
            max_interval: Duration::from_secs(3600),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// The same delay after every failure
    pub fn fixed(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Failed tasks are claimable again at once
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the `retry_count`-th failure (1-based). Zero for 0.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let base = match self.strategy {
            BackoffStrategy::Linear => self.initial_interval.saturating_mul(retry_count),
            BackoffStrategy::Exponential => {
                let factor = self.backoff_coefficient.powi(retry_count as i32 - 1);
                Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * factor)
                    .unwrap_or(self.max_interval)
            }
        };
        let capped = base.min(self.max_interval);
        if self.jitter.is_nan() || self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let jitter_range = secs * self.jitter.min(1.0);
        if jitter_range <= 0.0 {
            return capped;
        }
        let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
        Duration::try_from_secs_f64((secs + offset).max(0.0)).unwrap_or(capped)
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
