//! Dual-lane task queue.
//!
//! High-priority tasks go to the priority lane, everything else to the normal
//! lane. `dequeue` always drains the priority lane first; each lane is FIFO.
//! There is no aging, so a steady stream of high-priority work starves the
//! normal lane.
//!
//! The queue is bounded by default. On a full queue `enqueue` either fails
//! with [`SubmitError::QueueFull`] or suspends until a dequeue frees a slot,
//! depending on the configured [`BackpressurePolicy`].

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::config::BackpressurePolicy;
use crate::error::SubmitError;
use crate::worker::task::Task;

struct Lanes {
    priority: VecDeque<Arc<Task>>,
    normal: VecDeque<Arc<Task>>,
    /// Cleared while the scheduler drains. Checked under the lock on every
    /// admission attempt, including after a blocked producer wakes.
    accepting: bool,
}

impl Default for Lanes {
    fn default() -> Self {
        Self {
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            accepting: true,
        }
    }
}

impl Lanes {
    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    fn lane_for(&mut self, task: &Task) -> &mut VecDeque<Arc<Task>> {
        if task.is_high_priority() {
            &mut self.priority
        } else {
            &mut self.normal
        }
    }
}

/// Thread-safe priority/normal queue of pending tasks.
pub struct TaskQueue {
    lanes: Mutex<Lanes>,
    capacity: Option<usize>,
    policy: BackpressurePolicy,
    /// Woken on every enqueue (shared with the dispatch loop).
    wake: Arc<Notify>,
    /// Woken on every dequeue, for producers blocked on a full queue.
    space_freed: Notify,
}

impl TaskQueue {
    /// Create a queue. `wake` is notified whenever a task is enqueued.
    pub fn new(
        capacity: Option<usize>,
        policy: BackpressurePolicy,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            capacity,
            policy,
            wake,
            space_freed: Notify::new(),
        }
    }

    /// Unbounded queue with its own wake handle. Mostly useful in tests.
    pub fn unbounded() -> Self {
        Self::new(None, BackpressurePolicy::Reject, Arc::new(Notify::new()))
    }

    /// Append a task to the lane matching its priority.
    pub async fn enqueue(&self, task: Arc<Task>) -> Result<(), SubmitError> {
        loop {
            // Register interest before checking so a dequeue between the check
            // and the await is not missed.
            let space = self.space_freed.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut lanes = self.lanes.lock().await;
                if !lanes.accepting {
                    return Err(SubmitError::Draining);
                }
                match self.capacity {
                    Some(capacity) if lanes.len() >= capacity => {
                        if self.policy == BackpressurePolicy::Reject {
                            return Err(SubmitError::QueueFull { capacity });
                        }
                        debug!(task_id = %task.id, capacity, "Queue full, waiting for space");
                    }
                    _ => {
                        lanes.lane_for(&task).push_back(task);
                        drop(lanes);
                        self.wake.notify_one();
                        return Ok(());
                    }
                }
            }

            space.await;
        }
    }

    /// Stop admitting tasks. Producers blocked on a full queue wake up and
    /// fail with [`SubmitError::Draining`]; queued tasks stay put.
    pub async fn close(&self) {
        self.lanes.lock().await.accepting = false;
        self.space_freed.notify_waiters();
    }

    /// Admit tasks again after [`close`](Self::close).
    pub async fn open(&self) {
        self.lanes.lock().await.accepting = true;
    }

    /// Remove the next task: priority lane head, else normal lane head.
    pub async fn dequeue(&self) -> Option<Arc<Task>> {
        let task = {
            let mut lanes = self.lanes.lock().await;
            lanes
                .priority
                .pop_front()
                .or_else(|| lanes.normal.pop_front())
        };

        if task.is_some() {
            self.space_freed.notify_waiters();
        }
        task
    }

    /// Put a dequeued task back at the head of its lane.
    ///
    /// Never fails: the task was already admitted, so capacity is not checked
    /// and the queue can briefly hold one task over capacity.
    pub async fn requeue_front(&self, task: Arc<Task>) {
        let mut lanes = self.lanes.lock().await;
        lanes.lane_for(&task).push_front(task);
    }

    /// Total queued tasks across both lanes.
    pub async fn size(&self) -> usize {
        self.lanes.lock().await.len()
    }

    /// `(priority, normal)` lane lengths.
    pub async fn lane_sizes(&self) -> (usize, usize) {
        let lanes = self.lanes.lock().await;
        (lanes.priority.len(), lanes.normal.len())
    }

    pub async fn is_empty(&self) -> bool {
        self.size().await == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}
