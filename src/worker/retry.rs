//! Opt-in retry of failed tasks.
//!
//! The supervisor listens on the scheduler's event stream and resubmits a
//! failed task as a fresh task with `attempt + 1`, after a fixed backoff,
//! until `max_attempts` is reached. Errors that cannot succeed on a rerun
//! (unknown job type, bad arguments) are never retried.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::worker::events::TaskEvent;
use crate::worker::scheduler::Scheduler;
use crate::worker::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first run.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Policy from config, or `None` when retries are disabled.
    pub fn from_config(config: &SchedulerConfig) -> Option<Self> {
        (config.retry_max_attempts > 1)
            .then(|| Self::new(config.retry_max_attempts, config.retry_backoff))
    }

    pub fn should_retry(&self, task: &Task, retryable: bool) -> bool {
        retryable && task.attempt < self.max_attempts
    }
}

/// Spawn the retry supervisor. Runs until the returned handle is aborted.
pub fn spawn_retry_supervisor(scheduler: Arc<Scheduler>, policy: RetryPolicy) -> JoinHandle<()> {
    let mut events = scheduler.subscribe();

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let TaskEvent::Failed {
                task, retryable, ..
            } = event
            else {
                continue;
            };

            if !policy.should_retry(&task, retryable) {
                if retryable {
                    warn!(
                        task_id = %task.id,
                        job_type = %task.kind,
                        attempts = task.attempt,
                        "Giving up on task"
                    );
                }
                continue;
            }

            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                tokio::time::sleep(policy.backoff).await;
                match scheduler.resubmit(&task).await {
                    Ok(id) => info!(
                        task_id = %id,
                        previous = %task.id,
                        attempt = task.attempt + 1,
                        max_attempts = policy.max_attempts,
                        "Retrying task"
                    ),
                    Err(e) => warn!(task_id = %task.id, error = %e, "Retry not queued"),
                }
            });
        }
    })
}
