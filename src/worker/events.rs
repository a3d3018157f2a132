//! Task completion notifications.
//!
//! Every finished task produces exactly one [`TaskEvent`], delivered to every
//! channel subscriber and every registered [`TaskListener`]. Subscribers get
//! their own unbounded channel so a slow reader never loses events. Nothing is
//! persisted or replayed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::worker::task::Task;

/// Outcome notification for one finished task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Completed {
        worker_id: usize,
        task: Arc<Task>,
        result: serde_json::Value,
        duration_ms: u64,
    },
    Failed {
        worker_id: usize,
        task: Arc<Task>,
        error: String,
        /// False when running the task again cannot succeed.
        retryable: bool,
        duration_ms: u64,
    },
}

impl TaskEvent {
    pub fn task(&self) -> &Arc<Task> {
        match self {
            Self::Completed { task, .. } | Self::Failed { task, .. } => task,
        }
    }

    pub fn worker_id(&self) -> usize {
        match self {
            Self::Completed { worker_id, .. } | Self::Failed { worker_id, .. } => *worker_id,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            Self::Completed { duration_ms, .. } | Self::Failed { duration_ms, .. } => *duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Synchronous observer of task outcomes. Must not block.
pub trait TaskListener: Send + Sync {
    fn on_event(&self, event: &TaskEvent);
}

/// Fan-out of task events to channel subscribers and listeners.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>,
    listeners: Mutex<Vec<Arc<dyn TaskListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Deliver an event to everyone. Dropped receivers are pruned and a
    /// panicking listener is logged and skipped.
    pub fn publish(&self, event: TaskEvent) {
        let listeners: Vec<Arc<dyn TaskListener>> = lock(&self.listeners).clone();
        for listener in &listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))).is_err() {
                warn!(task_id = %event.task().id, "Task listener panicked");
            }
        }

        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

/// Log every event from `events` until `shutdown` fires, then flush what is
/// already buffered. Resolves to the number of events logged.
pub fn spawn_event_logger(
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut logged = 0;
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    log_event(&event);
                    logged += 1;
                }
                _ = &mut shutdown => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            log_event(&event);
            logged += 1;
        }
        logged
    })
}

fn log_event(event: &TaskEvent) {
    match event {
        TaskEvent::Completed {
            worker_id,
            task,
            duration_ms,
            ..
        } => info!(
            task_id = %task.id,
            job_type = %task.kind,
            worker_id,
            duration_ms,
            "Task completed"
        ),
        TaskEvent::Failed {
            worker_id,
            task,
            error,
            ..
        } => warn!(
            task_id = %task.id,
            job_type = %task.kind,
            worker_id,
            error = %error,
            "Task failed"
        ),
    }
}

// Poisoning only means some holder panicked; the vectors stay valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
