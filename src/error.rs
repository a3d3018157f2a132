//! Error types for the scheduler.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Submit error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors returned synchronously by `submit`. A rejected task never enters the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Job type must not be empty")]
    EmptyJobType,

    #[error("Queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Scheduler is draining and no longer accepts tasks")]
    Draining,
}

/// Execution failures. Each one is terminal for its task and isolated to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("No executor registered for job type {kind}")]
    UnknownJobType { kind: String },

    #[error("Job {kind} failed: {reason}")]
    ExecutionFailed { kind: String, reason: String },

    #[error("Job {kind} timed out after {timeout:?}")]
    Timeout { kind: String, timeout: Duration },

    #[error("Job {kind} panicked: {reason}")]
    Panicked { kind: String, reason: String },

    #[error("Invalid arguments for job {kind}: {reason}")]
    InvalidArguments { kind: String, reason: String },

    #[error("Failed to spawn process for job {kind}: {reason}")]
    Spawn { kind: String, reason: String },
}

impl JobError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownJobType { .. } | Self::InvalidArguments { .. }
        )
    }
}

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler in state {state}, cannot transition to {target}")]
    InvalidTransition { state: String, target: String },

    #[error("Drain timed out after {timeout:?} with {in_flight} task(s) still running")]
    DrainTimeout { timeout: Duration, in_flight: usize },

    #[error("Scheduler must be started from within a tokio runtime")]
    NoRuntime,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
