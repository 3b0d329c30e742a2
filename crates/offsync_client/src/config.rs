//! Configuration for the sync client.

use offsync_protocol::EntityType;
use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of queue entries claimed per batch.
    pub batch_size: usize,
    /// Failed attempts after which an entry is flagged stuck.
    pub max_retries: u32,
    /// Entity types requested from the change feed.
    pub pull_types: Vec<EntityType>,
    /// Per-type page size for change feed pulls.
    pub pull_limit: usize,
    /// Whether `sync_now` pulls the change feed after pushing.
    pub pull_after_push: bool,
    /// Cycle-level retry configuration.
    pub retry: RetryConfig,
    /// Interval for automatic sync.
    pub auto_sync_interval: Option<Duration>,
    /// Cycle timeout used by the async helpers.
    pub timeout: Duration,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            batch_size: 50,
            max_retries: 5,
            pull_types: EntityType::ALL.to_vec(),
            pull_limit: 100,
            pull_after_push: true,
            retry: RetryConfig::default(),
            auto_sync_interval: Some(Duration::from_secs(30)),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Sets the retry ceiling for individual entries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Sets the entity types to pull.
    pub fn with_pull_types(mut self, types: Vec<EntityType>) -> Self {
        self.pull_types = types;
        self
    }

    /// Sets the per-type pull page size.
    pub fn with_pull_limit(mut self, limit: usize) -> Self {
        self.pull_limit = limit.max(1);
        self
    }

    /// Enables or disables the pull phase of `sync_now`.
    pub fn with_pull_after_push(mut self, enabled: bool) -> Self {
        self.pull_after_push = enabled;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the automatic sync interval; `None` disables it.
    pub fn with_auto_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.auto_sync_interval = interval;
        self
    }

    /// Sets the cycle timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
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
    /// Maximum number of attempts.
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

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
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
