//! Queue configuration and statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for queue and pool behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent worker slots.
    pub workers: usize,
    /// Capacity of the local candidate channel.
    pub channel_capacity: usize,
    /// How often the dispatcher polls the driver for eligible jobs.
    pub poll_interval: Duration,
    /// Lease length of a job lock.
    pub lock_timeout: Duration,
    /// How often a running job's lease is renewed.
    pub heartbeat_interval: Duration,
    /// Minimum delay before the same candidate is pushed again.
    pub redispatch_after: Duration,
    /// Page size used when streaming results.
    pub results_page_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            channel_capacity: 64,
            poll_interval: Duration::from_millis(250),
            lock_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            redispatch_after: Duration::from_secs(2),
            results_page_size: 100,
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl QueueConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// - `QUEUE_WORKERS`
    /// - `QUEUE_CHANNEL_CAPACITY`
    /// - `QUEUE_POLL_INTERVAL_MS`
    /// - `QUEUE_LOCK_TIMEOUT_MS`
    /// - `QUEUE_HEARTBEAT_INTERVAL_MS`
    /// - `QUEUE_REDISPATCH_AFTER_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            workers: env_parse("QUEUE_WORKERS")?.unwrap_or(defaults.workers),
            channel_capacity: env_parse("QUEUE_CHANNEL_CAPACITY")?
                .unwrap_or(defaults.channel_capacity),
            poll_interval: env_millis("QUEUE_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            lock_timeout: env_millis("QUEUE_LOCK_TIMEOUT_MS")?.unwrap_or(defaults.lock_timeout),
            heartbeat_interval: env_millis("QUEUE_HEARTBEAT_INTERVAL_MS")?
                .unwrap_or(defaults.heartbeat_interval),
            redispatch_after: env_millis("QUEUE_REDISPATCH_AFTER_MS")?
                .unwrap_or(defaults.redispatch_after),
            results_page_size: defaults.results_page_size,
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub fn with_redispatch_after(mut self, redispatch_after: Duration) -> Self {
        self.redispatch_after = redispatch_after;
        self
    }
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    parse_value(var, std::env::var(var).ok())
}

fn parse_value<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
        None => Ok(None),
    }
}

fn env_millis(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(var)?.map(Duration::from_millis))
}

/// Advisory counts of the jobs known to a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    /// Every job in the store.
    pub total: u64,
    /// Not completed and not under a live lock.
    pub pending: u64,
    /// Not completed and under a live lock.
    pub in_progress: u64,
    /// Completed, with or without errors.
    pub completed: u64,
    /// Completed with at least one recorded error.
    pub errored: u64,
}

impl QueueStats {
    /// Jobs not yet completed.
    pub fn active(&self) -> u64 {
        self.pending + self.in_progress
    }

    /// True once every known job has completed.
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    /// Success rate as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        if self.completed == 0 {
            None
        } else {
            let succeeded = self.completed - self.errored;
            Some((succeeded as f64 / self.completed as f64) * 100.0)
        }
    }
}
