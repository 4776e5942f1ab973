use crate::config::types::{
    PartialFailurePolicy, RetryBackoffConfig, SinkConfig, TimeoutPolicy,
};
use std::time::Duration;

/// Retry and pause limits the delivery controller enforces
#[derive(Debug, Clone)]
pub struct DeliveryPolicy {
    pub attempt_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub backoff: Backoff,
    pub timeout_policy: TimeoutPolicy,
    pub timeout_retry_after: Duration,
    pub backpressure_ceiling: Duration,
    pub partial_failure: PartialFailurePolicy,
}

impl DeliveryPolicy {
    /// Total attempts allowed per batch
    pub fn attempt_ceiling(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl From<&SinkConfig> for DeliveryPolicy {
    fn from(config: &SinkConfig) -> Self {
        Self {
            attempt_timeout: config.attempt_timeout,
            max_retries: config.max_retries,
            backoff: Backoff::from(&config.retry_backoff),
            timeout_policy: config.timeout_policy,
            timeout_retry_after: config.timeout_retry_after,
            backpressure_ceiling: config.backpressure_ceiling,
            partial_failure: config.partial_failure,
        }
    }
}

/// Bounded exponential backoff. A multiplier of 1.0 gives a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
        }
    }

    /// Interval to wait after `previous`, or the initial interval for the first retry
    pub fn next(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial.min(self.max),
            Some(previous) => {
                let scaled = previous.as_secs_f64() * self.multiplier.max(1.0);
                if scaled >= self.max.as_secs_f64() {
                    self.max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }
}

impl From<&RetryBackoffConfig> for Backoff {
    fn from(config: &RetryBackoffConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max,
            multiplier: config.multiplier,
        }
    }
}
