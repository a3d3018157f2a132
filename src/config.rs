//! Configuration types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail fast with `SubmitError::QueueFull`.
    #[default]
    Reject,
    /// Suspend the caller until a slot frees up.
    Block,
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::Block => write!(f, "block"),
        }
    }
}

impl FromStr for BackpressurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(ConfigError::InvalidValue {
                key: "OPSCHED_BACKPRESSURE".to_string(),
                message: format!("expected `reject` or `block`, got `{other}`"),
            }),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers in the pool. Fixed for the scheduler's lifetime.
    pub worker_count: usize,
    /// Upper bound on how long the dispatch loop sleeps between checks.
    pub poll_interval: Duration,
    /// Maximum queued tasks across both lanes (None = unbounded).
    pub queue_capacity: Option<usize>,
    /// Behavior of `submit` on a full queue.
    pub backpressure: BackpressurePolicy,
    /// Per-task execution timeout (None = run to completion).
    pub task_timeout: Option<Duration>,
    /// Maximum time `stop` waits for in-flight work (None = wait forever).
    pub stop_timeout: Option<Duration>,
    /// Interval of the periodic stats log line.
    pub stats_interval: Duration,
    /// Total attempts per task including the first (1 = no retry).
    pub retry_max_attempts: u32,
    /// Delay before a failed task is resubmitted.
    pub retry_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval: Duration::from_millis(50),
            queue_capacity: Some(1024),
            backpressure: BackpressurePolicy::Reject,
            task_timeout: None,
            stop_timeout: None,
            stats_interval: Duration::from_secs(5),
            retry_max_attempts: 1,
            retry_backoff: Duration::from_millis(1000),
        }
    }
}

impl SchedulerConfig {
    /// Build config from `OPSCHED_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let worker_count = parse_var(&lookup, "OPSCHED_WORKERS")?.unwrap_or(defaults.worker_count);

        let poll_interval = parse_var::<u64, _>(&lookup, "OPSCHED_POLL_INTERVAL_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        // 0 means unbounded
        let queue_capacity = match parse_var::<usize, _>(&lookup, "OPSCHED_QUEUE_CAPACITY")? {
            Some(0) => None,
            Some(n) => Some(n),
            None => defaults.queue_capacity,
        };

        let backpressure = match lookup("OPSCHED_BACKPRESSURE") {
            Some(s) if !s.trim().is_empty() => s.parse()?,
            _ => defaults.backpressure,
        };

        let task_timeout = parse_var::<u64, _>(&lookup, "OPSCHED_TASK_TIMEOUT_SECS")?
            .map(Duration::from_secs);

        let stop_timeout = parse_var::<u64, _>(&lookup, "OPSCHED_STOP_TIMEOUT_SECS")?
            .map(Duration::from_secs);

        let stats_interval = parse_var::<u64, _>(&lookup, "OPSCHED_STATS_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.stats_interval);

        let retry_max_attempts = parse_var(&lookup, "OPSCHED_RETRY_MAX_ATTEMPTS")?
            .unwrap_or(defaults.retry_max_attempts);

        let retry_backoff = parse_var::<u64, _>(&lookup, "OPSCHED_RETRY_BACKOFF_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_backoff);

        let config = Self {
            worker_count,
            poll_interval,
            queue_capacity,
            backpressure,
            task_timeout,
            stop_timeout,
            stats_interval,
            retry_max_attempts,
            retry_backoff,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_count".to_string(),
                message: "pool needs at least one worker".to_string(),
            });
        }
        if self.queue_capacity == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "queue_capacity".to_string(),
                message: "capacity must be positive (use None for unbounded)".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "poll_interval".to_string(),
                message: "poll interval must be non-zero".to_string(),
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry_max_attempts".to_string(),
                message: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}
