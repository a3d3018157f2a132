//! Scheduler dispatch loop and lifecycle.
//!
//! Lifecycle: `Stopped → Running → Draining → Stopped`.
//!
//! The dispatch loop is the only code that pairs queued tasks with workers.
//! It dequeues a task, claims an idle worker and assigns the task; when every
//! worker is busy the task goes back to the head of its lane. Instead of
//! spinning it sleeps on a shared [`Notify`] woken by every enqueue and every
//! worker release, with `poll_interval` as the upper bound on a sleep.
//!
//! `stop` lets the loop finish everything that is already queued, waits for
//! all workers to go idle and only then reports `Stopped`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, SchedulerError, SubmitError};
use crate::worker::events::{EventBus, TaskEvent, TaskListener};
use crate::worker::pool::{PoolDeps, WorkerPool, WorkerSnapshot};
use crate::worker::queue::TaskQueue;
use crate::worker::registry::ExecutorRegistry;
use crate::worker::stats::{SchedulerStats, StatsCollector};
use crate::worker::task::{Task, TaskId, TaskRequest};

/// Lifecycle state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// No dispatch loop. Submitted tasks wait in the queue.
    Stopped,
    /// Dispatch loop is pairing tasks with workers.
    Running,
    /// `stop` was called: finishing queued and in-flight work.
    Draining,
}

impl SchedulerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: SchedulerState) -> bool {
        use SchedulerState::*;

        matches!(
            (self, target),
            (Stopped, Running) | (Running, Draining) | (Draining, Stopped)
        )
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Draining => "draining",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time scheduler status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub queue_size: usize,
    pub active_workers: usize,
    pub total_workers: usize,
}

/// Priority-aware task scheduler over a fixed worker pool.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<ExecutorRegistry>,
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    stats: Arc<StatsCollector>,
    events: Arc<EventBus>,
    /// Woken by enqueues, worker releases and `stop`.
    wake: Arc<Notify>,
    state: watch::Sender<SchedulerState>,
    /// Running dispatch loop. The lock also serializes start/stop.
    dispatcher: Mutex<Option<RunningLoop>>,
}

/// Flags for one run of the dispatch loop. Each `start` gets fresh ones so a
/// loop left behind by a timed-out drain can never be revived.
#[derive(Default)]
struct LoopControl {
    /// Exit once the queue is empty.
    draining: AtomicBool,
    /// Exit at the next iteration without touching the queue.
    halt: AtomicBool,
}

struct RunningLoop {
    handle: JoinHandle<()>,
    control: Arc<LoopControl>,
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<ExecutorRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let wake = Arc::new(Notify::new());
        let stats = Arc::new(StatsCollector::new());
        let events = Arc::new(EventBus::new());
        let queue = Arc::new(TaskQueue::new(
            config.queue_capacity,
            config.backpressure,
            Arc::clone(&wake),
        ));
        let pool = Arc::new(WorkerPool::new(
            config.worker_count,
            PoolDeps {
                registry: Arc::clone(&registry),
                stats: Arc::clone(&stats),
                events: Arc::clone(&events),
                wake: Arc::clone(&wake),
                task_timeout: config.task_timeout,
            },
        ));
        let (state, _) = watch::channel(SchedulerState::Stopped);

        Ok(Self {
            config,
            registry,
            queue,
            pool,
            stats,
            events,
            wake,
            state,
            dispatcher: Mutex::new(None),
        })
    }

    /// Queue a task. Returns its id immediately; the outcome arrives later as a
    /// [`TaskEvent`].
    ///
    /// Fails when the job type is empty, when the queue is full under the
    /// `Reject` policy, or while the scheduler is draining. Under the `Block`
    /// policy a full queue suspends the caller instead.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        self.submit_attempt(request, 1).await
    }

    /// Submit a new task with the same type, payload, args and priority as
    /// `task`, counting it as the next attempt.
    pub async fn resubmit(&self, task: &Task) -> Result<TaskId, SubmitError> {
        self.submit_attempt(task.to_request(), task.attempt + 1).await
    }

    async fn submit_attempt(
        &self,
        request: TaskRequest,
        attempt: u32,
    ) -> Result<TaskId, SubmitError> {
        if request.kind.trim().is_empty() {
            return Err(SubmitError::EmptyJobType);
        }
        if self.state() == SchedulerState::Draining {
            return Err(SubmitError::Draining);
        }

        let task = Arc::new(Task::from_request(request, attempt));
        let id = task.id.clone();
        let priority = task.priority;
        let kind = task.kind.clone();

        self.queue.enqueue(task).await?;
        debug!(task_id = %id, job_type = %kind, %priority, attempt, "Task queued");
        Ok(id)
    }

    /// Start the dispatch loop. A no-op while already running.
    /// Fails with `InvalidTransition` while a drain is in progress.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.state() == SchedulerState::Draining {
            return Err(SchedulerError::InvalidTransition {
                state: SchedulerState::Draining.to_string(),
                target: SchedulerState::Running.to_string(),
            });
        }
        let mut dispatcher = self.dispatcher.lock().await;

        let current = self.state();
        match current {
            SchedulerState::Running => return Ok(()),
            SchedulerState::Draining => {
                return Err(SchedulerError::InvalidTransition {
                    state: current.to_string(),
                    target: SchedulerState::Running.to_string(),
                });
            }
            SchedulerState::Stopped => {}
        }

        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let control = Arc::new(LoopControl::default());
        let handle = runtime.spawn(dispatch_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.pool),
            Arc::clone(&self.wake),
            Arc::clone(&control),
            self.config.poll_interval,
        ));
        *dispatcher = Some(RunningLoop { handle, control });
        self.state.send_replace(SchedulerState::Running);

        info!(
            workers = self.pool.total(),
            executors = self.registry.count().await,
            queued = self.queue.size().await,
            "Scheduler started"
        );
        Ok(())
    }

    /// Drain and stop: dispatch everything already queued, wait for every
    /// in-flight task to finish, then transition to `Stopped`.
    ///
    /// Admission closes first, so a producer blocked on a full queue is
    /// rejected with [`SubmitError::Draining`] rather than slipping in after
    /// the loop has exited. Submissions are accepted again once `Stopped`.
    ///
    /// Waits indefinitely unless `stop_timeout` is configured. On timeout the
    /// dispatch loop is halted, the scheduler is marked `Stopped` and running
    /// tasks are left to finish in the background.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut dispatcher = self.dispatcher.lock().await;
        if self.state() == SchedulerState::Stopped {
            return Ok(());
        }

        self.state.send_replace(SchedulerState::Draining);
        self.queue.close().await;

        let running = dispatcher.take();
        let control = running.as_ref().map(|r| Arc::clone(&r.control));
        if let Some(control) = &control {
            control.draining.store(true, Ordering::Release);
        }
        self.wake.notify_one();

        let queued = self.queue.size().await;
        info!(
            queued = queued,
            active = self.pool.active_count(),
            "Scheduler draining"
        );

        let pool = Arc::clone(&self.pool);
        let drain = async move {
            if let Some(running) = running
                && let Err(e) = running.handle.await
            {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
            pool.wait_idle().await;
        };

        let result = match self.config.stop_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, drain).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    // Halted, not aborted: the loop may hold a dequeued task.
                    if let Some(control) = &control {
                        control.halt.store(true, Ordering::Release);
                    }
                    self.wake.notify_one();
                    let in_flight = self.pool.active_count();
                    warn!(?timeout, in_flight, "Drain timed out");
                    Err(SchedulerError::DrainTimeout { timeout, in_flight })
                }
            },
            None => {
                drain.await;
                Ok(())
            }
        };

        self.queue.open().await;
        self.state.send_replace(SchedulerState::Stopped);
        let stats = self.stats().await;
        info!(
            processed = stats.total_processed,
            succeeded = stats.success_count,
            failed = stats.error_count,
            "Scheduler stopped"
        );
        result
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn state_watch(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state(),
            queue_size: self.queue.size().await,
            active_workers: self.pool.active_count(),
            total_workers: self.pool.total(),
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.snapshot(
            self.queue.size().await,
            self.pool.active_count(),
            self.pool.total(),
        )
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        self.pool.snapshot()
    }

    /// Receive every task event emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn TaskListener>) {
        self.events.add_listener(listener);
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

async fn dispatch_loop(
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    wake: Arc<Notify>,
    control: Arc<LoopControl>,
    poll_interval: Duration,
) {
    debug!("Dispatch loop started");

    loop {
        if control.halt.load(Ordering::Acquire) {
            break;
        }
        // Set only after the queue is closed, so an empty dequeue below is final.
        let drain = control.draining.load(Ordering::Acquire);

        match queue.dequeue().await {
            Some(task) => match pool.find_idle() {
                Some(worker) => {
                    pool.assign(worker, task);
                    continue;
                }
                None => {
                    // Pool saturated: keep the task's place and wait for a release
                    queue.requeue_front(task).await;
                }
            },
            None if drain => break,
            None => {}
        }

        let _ = tokio::time::timeout(poll_interval, wake.notified()).await;
    }

    debug!("Dispatch loop exited");
}

/// Spawn a background task that logs scheduler stats every `interval`.
pub fn spawn_stats_reporter(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = scheduler.stats().await;
            info!(
                state = %scheduler.state(),
                processed = stats.total_processed,
                succeeded = stats.success_count,
                failed = stats.error_count,
                queued = stats.queue_size,
                active = stats.active_workers,
                workers = stats.total_workers,
                avg_ms = format!("{:.1}", stats.average_duration_ms),
                "Scheduler stats"
            );
        }
    })
}
