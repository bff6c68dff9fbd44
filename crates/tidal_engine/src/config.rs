//! Configuration for the sync engine.

use std::time::Duration;
use tidal_core::BackoffPolicy;

/// Configuration for sync cycles.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Age after which an entity type is pulled again.
    pub cache_ttl: Duration,
    /// Wall-clock budget for the push phase of one cycle.
    pub push_time_budget: Duration,
    /// Operations of distinct entities pushed concurrently.
    pub worker_width: usize,
    /// Age after which an in-flight operation is considered abandoned.
    pub flight_timeout: Duration,
    /// Minimum spacing between reconnect-triggered cycles.
    pub reconnect_debounce: Duration,
    /// Attempts allowed per operation.
    pub max_attempts: u32,
    /// Retry delay policy.
    pub backoff: BackoffPolicy,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5 * 60),
            push_time_budget: Duration::from_secs(30),
            worker_width: 1,
            flight_timeout: Duration::from_secs(60),
            reconnect_debounce: Duration::from_secs(2),
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Sets the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Sets the push time budget.
    pub fn with_push_time_budget(mut self, budget: Duration) -> Self {
        self.push_time_budget = budget;
        self
    }

    /// Sets the worker pool width. Zero is treated as one.
    pub fn with_worker_width(mut self, width: usize) -> Self {
        self.worker_width = width.max(1);
        self
    }

    /// Sets the flight timeout.
    pub fn with_flight_timeout(mut self, timeout: Duration) -> Self {
        self.flight_timeout = timeout;
        self
    }

    /// Sets the reconnect debounce window.
    pub fn with_reconnect_debounce(mut self, window: Duration) -> Self {
        self.reconnect_debounce = window;
        self
    }

    /// Sets the attempts allowed per operation. Zero is treated as one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Interval between periodic cycles.
    pub periodic_interval: Duration,
    /// Minimum spacing between a periodic cycle and the previous cycle.
    pub min_interval: Duration,
}

impl SchedulerConfig {
    /// Creates a configuration where `min_interval` equals `periodic_interval`.
    pub fn new(periodic_interval: Duration) -> Self {
        Self {
            periodic_interval,
            min_interval: periodic_interval,
        }
    }

    /// Sets the minimum spacing between cycles.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.worker_width, 1);
        assert_eq!(config.flight_timeout, Duration::from_secs(60));
        assert_eq!(config.reconnect_debounce, Duration::from_secs(2));
        assert_eq!(config.max_attempts, 3);

        let scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.min_interval, scheduler.periodic_interval);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_worker_width(0)
            .with_max_attempts(5)
            .with_push_time_budget(Duration::from_secs(1))
            .with_backoff(BackoffPolicy::default().without_jitter());

        assert_eq!(config.worker_width, 1);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.push_time_budget, Duration::from_secs(1));
        assert_eq!(config.backoff.jitter, 0.0);
    }

    #[test]
    fn scheduler_min_interval_override() {
        let config = SchedulerConfig::new(Duration::from_secs(60))
            .with_min_interval(Duration::from_secs(10));
        assert_eq!(config.periodic_interval, Duration::from_secs(60));
        assert_eq!(config.min_interval, Duration::from_secs(10));
    }
}
