//! Engine configuration and retry policy.

use std::time::Duration;

use uuid::Uuid;

/// Retry shape applied by the durable queue when a retryable failure is
/// reported.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Default attempt budget for jobs that do not override it.
    pub max_attempts: i32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following `attempt` (1-based): doubles per
    /// failed attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 31) as u32;
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp));
        delay.min(self.max_delay)
    }
}

/// Configuration for the engine: worker pool, supervisor, and submission
/// estimates.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent executors in the worker pool.
    pub concurrency: usize,
    /// Rate limit on job starts per second across the pool. `None` disables it.
    pub starts_per_second: Option<u32>,
    /// How long an executor sleeps when no jobs are claimable.
    pub poll_interval: Duration,
    /// How often a running job's lease is extended.
    pub heartbeat_interval: Duration,
    /// Lease duration handed to the durable queue.
    pub lease_duration: Duration,
    /// Wall-clock budget for a single execution attempt.
    pub job_timeout: Duration,
    /// How often the supervisor scans for stale and expired state.
    pub sweep_interval: Duration,
    /// A non-terminal job whose state has not moved for this long is
    /// force-terminated.
    pub stale_after: Duration,
    /// How long terminal state is kept for late status queries.
    pub retention: Duration,
    /// Empirical per-job duration used for `estimated_wait_ms`.
    pub estimated_job_duration: Duration,
    /// Capacity of each per-job event channel.
    pub event_capacity: usize,
    /// Worker ID prefix for this instance.
    pub worker_id: String,
    /// Retry shape for the built-in in-memory queue.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            starts_per_second: None,
            poll_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            job_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            retention: Duration::from_secs(3600),
            estimated_job_duration: Duration::from_secs(5),
            event_capacity: 256,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with a specific worker ID prefix.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, 4);
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.starts_per_second.is_none());
    }

    #[test]
    fn config_with_worker_id() {
        let config = EngineConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(30), Duration::from_secs(60));
    }

    #[test]
    fn backoff_survives_absurd_attempt_numbers() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(i32::MAX), policy.max_delay);
        assert_eq!(policy.delay_for(0), policy.base_delay);
    }
}
