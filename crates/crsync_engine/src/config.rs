//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::time::Duration;

/// Configuration for a sync worker.
///
/// Each worker owns its configuration; nothing is read from process-wide
/// defaults.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Idle time-to-live for cached database handles.
    pub cache_ttl: Duration,
    /// Maximum number of change records per pushed or pulled batch.
    pub batch_size: usize,
    /// How often a session pulls remote changes. `None` disables pulling.
    pub pull_interval: Option<Duration>,
    /// Capacity of the worker's inbound and outbound message channels.
    pub channel_capacity: usize,
    /// Retry configuration for failed pushes.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            batch_size: 100,
            pull_interval: None,
            channel_capacity: 64,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = Some(interval);
        self
    }

    /// Sets the channel capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.cache_ttl.is_zero() {
            return Err(SyncError::InvalidConfig("cache ttl must be greater than zero".into()));
        }
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig("batch size must be greater than zero".into()));
        }
        if self.channel_capacity == 0 {
            return Err(SyncError::InvalidConfig(
                "channel capacity must be greater than zero".into(),
            ));
        }
        if matches!(self.pull_interval, Some(interval) if interval.is_zero()) {
            return Err(SyncError::InvalidConfig(
                "pull interval must be greater than zero".into(),
            ));
        }
        self.retry.validate()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts for one batch before waiting for the next trigger.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Checks that the backoff can be computed.
    pub fn validate(&self) -> SyncResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(SyncError::InvalidConfig(format!(
                "backoff multiplier must be a finite number of at least 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(SyncError::InvalidConfig(
                "initial retry delay exceeds the maximum delay".into(),
            ));
        }
        Ok(())
    }

    /// Returns true if another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());
        let delay_secs = if self.add_jitter {
            // Up to 25% jitter
            delay_secs + delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0)
        } else {
            delay_secs
        };
        // Negative or NaN values from an unvalidated multiplier.
        Duration::try_from_secs_f64(delay_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_cache_ttl(Duration::from_secs(5))
            .with_batch_size(25)
            .with_pull_interval(Duration::from_secs(2))
            .with_channel_capacity(8);

        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.pull_interval, Some(Duration::from_secs(2)));
        assert_eq!(config.channel_capacity, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let config = SyncConfig::new().with_cache_ttl(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn zero_batch_is_rejected() {
        let config = SyncConfig::new().with_batch_size(0);
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn unusable_backoff_multiplier_is_rejected() {
        for multiplier in [f64::NAN, f64::INFINITY, -2.0, 0.5] {
            let config = SyncConfig::new()
                .with_retry(RetryConfig::new(3).with_backoff_multiplier(multiplier));
            assert!(
                matches!(config.validate(), Err(SyncError::InvalidConfig(_))),
                "multiplier {multiplier}"
            );
        }
        assert!(SyncConfig::new()
            .with_retry(RetryConfig::no_retry())
            .validate()
            .is_ok());
    }

    #[test]
    fn inverted_retry_delays_are_rejected() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(1));
        assert!(matches!(
            SyncConfig::new().with_retry(retry).validate(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unvalidated_multiplier_never_panics() {
        for multiplier in [f64::NAN, -2.0] {
            let config = RetryConfig::new(5)
                .with_max_delay(Duration::from_secs(3))
                .with_backoff_multiplier(multiplier)
                .without_jitter();
            assert!(config.delay_for_attempt(2) <= Duration::from_secs(3));
        }
    }

    #[test]
    fn retry_config_no_retry() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert!(config.allows_retry(0));
        assert!(!config.allows_retry(1));
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        // Jitter makes exact values unpredictable, but bounds hold
        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
