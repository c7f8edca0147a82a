//! Configuration for replication jobs and the replication controller.

use rand::Rng;
use std::time::Duration;

/// Default replication interval: one hour.
pub const DEFAULT_INTERVAL_SECONDS: u64 = 3600;

/// Default namespace for controller settings keys.
pub const DEFAULT_SETTINGS_PREFIX: &str = "revsync";

/// Configuration for a single replication job.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Maximum number of changed documents handled per batch.
    pub batch_size: usize,
    /// Retry configuration for transient transport faults.
    pub retry: RetryConfig,
    /// Request timeout, passed to transports that honour it.
    pub timeout: Duration,
}

impl ReplicatorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 100,
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
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
            max_attempts: max_attempts.max(1),
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // up to 25% extra
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the replication controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Seconds between periodic replications.
    pub interval_seconds: u64,
    /// Namespace prepended to every settings key.
    pub settings_prefix: String,
}

impl ControllerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            settings_prefix: DEFAULT_SETTINGS_PREFIX.to_string(),
        }
    }

    /// Sets the replication interval.
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval_seconds = seconds;
        self
    }

    /// Sets the settings key namespace.
    pub fn with_settings_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings_prefix = prefix.into();
        self
    }

    /// Key of the persisted periodic-active flag.
    pub fn periodic_active_key(&self) -> String {
        format!("{}.periodic.active", self.settings_prefix)
    }

    /// Key of the persisted monotonic due time.
    pub fn due_monotonic_key(&self) -> String {
        format!("{}.periodic.due_monotonic", self.settings_prefix)
    }

    /// Key of the persisted wall-clock due time.
    pub fn due_wall_clock_key(&self) -> String {
        format!("{}.periodic.due_wall_clock", self.settings_prefix)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replicator_config_builder() {
        let config = ReplicatorConfig::new()
            .with_batch_size(25)
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(ReplicatorConfig::new().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(126));

        assert!(config.delay_for_attempt(2) >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert!(config.delay_for_attempt(5) <= Duration::from_millis(6250));
    }

    #[test]
    fn controller_keys_are_namespaced() {
        let config = ControllerConfig::new().with_settings_prefix("app.sync");
        assert_eq!(config.interval_seconds, 3600);
        assert_eq!(config.periodic_active_key(), "app.sync.periodic.active");
        assert_eq!(config.due_monotonic_key(), "app.sync.periodic.due_monotonic");
        assert_eq!(config.due_wall_clock_key(), "app.sync.periodic.due_wall_clock");
    }
}
