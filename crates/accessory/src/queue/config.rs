//! Queue configuration

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::backoff::BackoffPolicy;
use crate::error::Error;

/// Queue and runner configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Partition served by this queue
    pub namespace: String,

    /// Default expiry horizon, measured from creation
    #[serde(default, with = "option_duration_millis")]
    pub max_age: Option<Duration>,

    /// Failed releases allowed before a task is discarded
    pub max_retries: u32,

    /// Parallel handler invocations
    pub workers: usize,

    /// Per-task execution deadline
    #[serde(default, with = "option_duration_millis")]
    pub deadline: Option<Duration>,

    /// Delay before a failed task is retried
    pub backoff: BackoffPolicy,

    /// Pause between claim attempts while the queue is empty
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Claims older than this are cleared so another worker can take the task
    #[serde(default, with = "option_duration_millis")]
    pub reclaim_after: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            max_age: None,
            max_retries: 10,
            workers: num_cpus::get(),
            deadline: None,
            backoff: BackoffPolicy::default(),
            poll_interval: Duration::from_secs(1),
            reclaim_after: None,
        }
    }
}

impl QueueConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the per-task deadline; zero means none
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = (!deadline.is_zero()).then_some(deadline);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reclaim_after(mut self, after: Duration) -> Self {
        self.reclaim_after = Some(after);
        self
    }

    /// Reject option values the queue cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_retries == 0 {
            return Err(Error::bad_parameter("max_retries must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(Error::bad_parameter("workers must be greater than 0"));
        }
        if self.max_age.is_some_and(|age| age.is_zero()) {
            return Err(Error::bad_parameter("max_age must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::bad_parameter("poll_interval must be greater than 0"));
        }
        if self.reclaim_after.is_some_and(|after| after.is_zero()) {
            return Err(Error::bad_parameter("reclaim_after must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(Error::bad_parameter("backoff jitter must be within 0.0-1.0"));
        }
        Ok(())
    }

    /// Read `ACCESSORY_*` variables over the defaults
    ///
    /// `ACCESSORY_BACKOFF_MS` selects linear backoff with that base.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Ok(namespace) = std::env::var("ACCESSORY_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(ms) = env_parse::<u64>("ACCESSORY_MAX_AGE_MS")? {
            config.max_age = Some(Duration::from_millis(ms));
        }
        if let Some(n) = env_parse("ACCESSORY_MAX_RETRIES")? {
            config.max_retries = n;
        }
        if let Some(n) = env_parse("ACCESSORY_WORKERS")? {
            config.workers = n;
        }
        if let Some(ms) = env_parse("ACCESSORY_DEADLINE_MS")? {
            config = config.with_deadline(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse("ACCESSORY_BACKOFF_MS")? {
            config.backoff = BackoffPolicy::linear(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse("ACCESSORY_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("ACCESSORY_RECLAIM_AFTER_MS")? {
            config.reclaim_after = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, Error> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::bad_parameter(format!("{name}: invalid value {value:?}"))),
        Err(_) => Ok(None),
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

/// Serde support for Option<Duration> as milliseconds or null
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.workers, num_cpus::get());
        assert_eq!(config.deadline, None);
        assert_eq!(config.max_age, None);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.backoff.delay_for(1), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = QueueConfig::new("email")
            .with_max_age(Duration::from_secs(3600))
            .with_max_retries(3)
            .with_workers(2)
            .with_deadline(Duration::from_secs(30))
            .with_backoff(BackoffPolicy::none())
            .with_poll_interval(Duration::from_millis(50))
            .with_reclaim_after(Duration::from_secs(600));

        assert_eq!(config.namespace, "email");
        assert_eq!(config.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.workers, 2);
        assert_eq!(config.deadline, Some(Duration::from_secs(30)));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.reclaim_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_zero_deadline_means_none() {
        let config = QueueConfig::default().with_deadline(Duration::ZERO);
        assert_eq!(config.deadline, None);
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let mut nan_jitter = BackoffPolicy::default();
        nan_jitter.jitter = f64::NAN;
        let mut wide_jitter = BackoffPolicy::default();
        wide_jitter.jitter = 2.0;

        let cases = [
            QueueConfig::default().with_max_retries(0),
            QueueConfig::default().with_workers(0),
            QueueConfig::default().with_max_age(Duration::ZERO),
            QueueConfig::default().with_poll_interval(Duration::ZERO),
            QueueConfig::default().with_reclaim_after(Duration::ZERO),
            QueueConfig::default().with_backoff(nan_jitter),
            QueueConfig::default().with_backoff(wide_jitter),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(Error::BadParameter(_))),
                "accepted {config:?}"
            );
        }
    }

    #[test]
    fn test_serde_uses_millis() {
        let config = QueueConfig::new("q")
            .with_workers(4)
            .with_deadline(Duration::from_millis(2500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["deadline"], 2500);
        assert_eq!(json["poll_interval"], 1000);
        assert!(json["max_age"].is_null());

        let back: QueueConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
