//! Fixed-size worker pool.
//!
//! A [`Worker`] is one execution slot. The pool hands out idle workers with an
//! atomic claim (`find_idle`) and runs assigned tasks on their own tokio task
//! (`assign`). On completion the worker records the outcome and publishes the
//! event *before* it becomes idle again, so anyone waiting for the pool to go
//! idle has already seen every notification.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::JobError;
use crate::worker::events::{EventBus, TaskEvent};
use crate::worker::executor::{JobOutput, JobRequest};
use crate::worker::registry::ExecutorRegistry;
use crate::worker::stats::StatsCollector;
use crate::worker::task::{Task, TaskId};

/// Shared dependencies for task execution.
#[derive(Clone)]
pub struct PoolDeps {
    pub registry: Arc<ExecutorRegistry>,
    pub stats: Arc<StatsCollector>,
    pub events: Arc<EventBus>,
    /// Notified whenever a worker becomes idle (shared with the dispatch loop).
    pub wake: Arc<Notify>,
    pub task_timeout: Option<Duration>,
}

/// One concurrent execution slot.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    busy: AtomicBool,
    current_task: Mutex<Option<Arc<Task>>>,
    processed_count: AtomicU64,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            busy: AtomicBool::new(false),
            current_task: Mutex::new(None),
            processed_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.slot().clone()
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            busy: self.is_busy(),
            current_task: self.current_task().map(|t| t.id.clone()),
            processed_count: self.processed_count(),
        }
    }

    /// Atomically flip idle → busy. Only one caller can win.
    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn bind(&self, task: Arc<Task>) {
        *self.slot() = Some(task);
    }

    /// Clear the task, bump the counter, then become eligible for reassignment.
    fn release(&self) {
        self.slot().take();
        self.processed_count.fetch_add(1, Ordering::AcqRel);
        self.busy.store(false, Ordering::Release);
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Task>>> {
        self.current_task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Serializable view of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub busy: bool,
    pub current_task: Option<TaskId>,
    pub processed_count: u64,
}

/// Fixed collection of workers. Not resizable.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    deps: PoolDeps,
    /// Notified on every release, for `wait_idle`.
    released: Arc<Notify>,
}

impl WorkerPool {
    /// Create a pool of `size` workers with ids `0..size`.
    pub fn new(size: usize, deps: PoolDeps) -> Self {
        Self {
            workers: (0..size).map(|id| Arc::new(Worker::new(id))).collect(),
            deps,
            released: Arc::new(Notify::new()),
        }
    }

    /// Claim an idle worker, or `None` if all are busy.
    pub fn find_idle(&self) -> Option<Arc<Worker>> {
        self.workers.iter().find(|w| w.try_claim()).cloned()
    }

    /// Bind `task` to a worker claimed via [`find_idle`](Self::find_idle) and
    /// start executing it in the background.
    pub fn assign(&self, worker: Arc<Worker>, task: Arc<Task>) -> JoinHandle<()> {
        debug_assert!(worker.is_busy(), "assign requires a claimed worker");
        debug!(worker_id = worker.id, task_id = %task.id, job_type = %task.kind, "Assigning task");

        worker.bind(Arc::clone(&task));
        let deps = self.deps.clone();
        let released = Arc::clone(&self.released);

        tokio::spawn(async move {
            let _release = ReleaseGuard {
                worker: Arc::clone(&worker),
                released,
                wake: Arc::clone(&deps.wake),
            };
            run_task(&deps, &worker, task).await;
        })
    }

    /// Number of workers currently claimed or executing.
    pub fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    pub fn total(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    /// Wait until every worker is idle.
    pub async fn wait_idle(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.active_count() == 0 {
                return;
            }
            released.await;
        }
    }
}

/// Execute one task and report its outcome exactly once. The caller releases
/// the worker afterwards.
async fn run_task(deps: &PoolDeps, worker: &Worker, task: Arc<Task>) {
    let start = Instant::now();
    let result = execute(deps, &task).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    deps.stats.record_outcome(result.is_ok(), duration_ms);

    let event = match result {
        Ok(output) => {
            debug!(worker_id = worker.id, task_id = %task.id, duration_ms, "Task completed");
            TaskEvent::Completed {
                worker_id: worker.id,
                task,
                result: output.output,
                duration_ms,
            }
        }
        Err(e) => {
            warn!(
                worker_id = worker.id,
                task_id = %task.id,
                job_type = %task.kind,
                attempt = task.attempt,
                duration_ms,
                error = %e,
                "Task failed"
            );
            TaskEvent::Failed {
                worker_id: worker.id,
                task,
                error: e.to_string(),
                retryable: e.is_retryable(),
                duration_ms,
            }
        }
    };

    deps.events.publish(event);
}

/// Frees the worker when its task future ends, including by unwinding.
struct ReleaseGuard {
    worker: Arc<Worker>,
    released: Arc<Notify>,
    wake: Arc<Notify>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.worker.release();
        self.released.notify_waiters();
        self.wake.notify_one();
    }
}

/// Look up the executor and run it on its own tokio task so a panic or a
/// timeout stays contained.
async fn execute(deps: &PoolDeps, task: &Arc<Task>) -> Result<JobOutput, JobError> {
    let executor = deps
        .registry
        .get(&task.kind)
        .await
        .ok_or_else(|| JobError::UnknownJobType {
            kind: task.kind.clone(),
        })?;

    let owned = Arc::clone(task);
    let handle = tokio::spawn(async move {
        let request = JobRequest::from_task(&owned);
        executor.execute(&request).await
    });
    let abort = handle.abort_handle();

    let joined = match deps.task_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(JobError::Timeout {
                    kind: task.kind.clone(),
                    timeout,
                });
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobError::Panicked {
            kind: task.kind.clone(),
            reason: panic_message(e.into_panic()),
        }),
        Err(e) => Err(JobError::ExecutionFailed {
            kind: task.kind.clone(),
            reason: e.to_string(),
        }),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
