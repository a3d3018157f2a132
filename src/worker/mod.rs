//! Worker system — priority queue, worker pool and dispatch.
//!
//! Core components:
//! - `task` — Task types (TaskRequest, Task, Priority)
//! - `queue` — Dual-lane task queue (high before normal, FIFO within a lane)
//! - `executor` — JobExecutor trait and built-in executors
//! - `registry` — Job type → executor lookup
//! - `pool` — Fixed set of workers, one task each
//! - `events` — Completion/failure notifications
//! - `stats` — Running counters
//! - `scheduler` — Dispatch loop and lifecycle (Stopped → Running → Draining → Stopped)
//! - `retry` — Optional resubmission of failed tasks

pub mod events;
pub mod executor;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod task;

pub use events::{EventBus, TaskEvent, TaskListener, spawn_event_logger};
pub use executor::{FnExecutor, JobExecutor, JobOutput, JobRequest, ShellExecutor};
pub use pool::{Worker, WorkerPool, WorkerSnapshot};
pub use queue::TaskQueue;
pub use registry::ExecutorRegistry;
pub use retry::{RetryPolicy, spawn_retry_supervisor};
pub use scheduler::{Scheduler, SchedulerState, SchedulerStatus, spawn_stats_reporter};
pub use stats::{SchedulerStats, StatsCollector};
pub use task::{Priority, Task, TaskId, TaskRequest};
